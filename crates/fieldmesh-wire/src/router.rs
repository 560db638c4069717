//! Router: a standalone message switch.
//!
//! A router owns a multiplexing listener for nodes and child routers and,
//! below the tree root, a point-to-point channel to its parent. Frames not
//! addressed to the router are relayed as received, without decoding the
//! payload. Frames addressed to it are dispatched to its route table.
//!
//! Messages the router originates are retried from two outboxes: one for the
//! listener side and one for the parent channel.

use crate::dispatch::{Handler, WorkerPool};
use crate::error::{WireError, WireResult};
use crate::frame::{is_own_id, Frame};
use crate::node::{compose, is_repeatable, outgoing_frame, SendOptions};
use crate::outbox::{spawn_retry_loop, Outbox};
use crate::registry::PeerRegistry;
use crate::stream::unwrap_batch;
use crate::transport::{self, Origin, Upstream};
use fieldmesh_types::{keys, Address, Flag, Message, RouterConfig, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler for a message addressed to a router. Receives the router so it
/// can reply, forward or update profile state.
pub trait RouteHandler: Send + Sync + 'static {
    fn handle(&self, router: &Router, msg: Message);
}

impl<F> RouteHandler for F
where
    F: Fn(&Router, Message) + Send + Sync + 'static,
{
    fn handle(&self, router: &Router, msg: Message) {
        self(router, msg)
    }
}

/// Key → handler table injected into a router at start.
#[derive(Clone, Default)]
pub struct RouteTable {
    handlers: HashMap<String, Arc<dyn RouteHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, key: impl Into<String>, handler: impl RouteHandler) -> Self {
        self.handlers.insert(key.into(), Arc::new(handler));
        self
    }

    /// Register a value-only handler, as a node listen would be.
    pub fn on_value(self, key: impl Into<String>, handler: impl Handler) -> Self {
        self.on(key, move |_router: &Router, msg: Message| {
            handler.handle(msg.into_value())
        })
    }

    /// Add every entry of `other` that this table does not already have.
    pub fn merge(mut self, other: RouteTable) -> Self {
        for (key, handler) in other.handlers {
            self.handlers.entry(key).or_insert(handler);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn RouteHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable").field("keys", &self.keys()).finish()
    }
}

/// The channel a frame left on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Listener,
    Parent,
}

struct RouterInner {
    id: String,
    config: RouterConfig,
    routes: RouteTable,
    parent: Option<Upstream>,
    registry: PeerRegistry,
    peer_outbox: Outbox,
    parent_outbox: Outbox,
    pool: WorkerPool,
    counter: AtomicU64,
    local_addr: SocketAddr,
    loopback: mpsc::UnboundedSender<(Origin, Frame)>,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running router. Cheap to clone; all clones share one router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("parent", &self.parent_id())
            .finish()
    }
}

impl Router {
    /// Bind the listener, connect to the parent when one is configured, and
    /// start the I/O loop and both retry loops.
    pub async fn start(config: RouterConfig, routes: RouteTable) -> WireResult<Router> {
        if config.id.is_empty() {
            return Err(WireError::Config("router id must not be empty".into()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new();
        let mut tasks = Vec::new();

        let (local_addr, accept) = transport::listen(
            config.listen,
            &config.id,
            registry.clone(),
            inbound_tx.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        tasks.push(accept);

        let mut parent = None;
        if let Some(up) = &config.parent {
            match transport::dial(&config.id, up, inbound_tx.clone(), shutdown_rx.clone()).await {
                Ok((channel, handles)) => {
                    parent = Some(channel);
                    tasks.extend(handles);
                }
                Err(e) => {
                    let _ = shutdown_tx.send(true);
                    return Err(e);
                }
            }
        }

        let inner = Arc::new(RouterInner {
            id: config.id.clone(),
            pool: WorkerPool::new(config.max_handlers),
            config,
            routes,
            parent,
            registry,
            peer_outbox: Outbox::new("listener"),
            parent_outbox: Outbox::new("parent"),
            counter: AtomicU64::new(0),
            local_addr,
            loopback: inbound_tx,
            closing: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        let router = Router { inner };

        tasks.push(tokio::spawn(run_loop(
            router.clone(),
            inbound_rx,
            shutdown_rx.clone(),
        )));
        for outbox in [
            router.inner.peer_outbox.clone(),
            router.inner.parent_outbox.clone(),
        ] {
            let weak = Arc::downgrade(&router.inner);
            tasks.push(spawn_retry_loop(
                outbox,
                router.inner.config.repeat_interval(),
                shutdown_rx.clone(),
                move |dest, frame| {
                    if let Some(inner) = weak.upgrade() {
                        Router { inner }.transmit(dest, frame);
                    }
                },
            ));
        }

        router.track(tasks);
        info!(
            router = %router.inner.id,
            addr = %local_addr,
            parent = ?router.parent_id(),
            "Router started"
        );
        Ok(router)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent.as_ref().map(Upstream::id)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Ids of messages this router sent that still await confirmation.
    pub fn pending(&self) -> Vec<String> {
        let mut ids = self.inner.peer_outbox.ids();
        ids.extend(self.inner.parent_outbox.ids());
        ids.sort();
        ids
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// A receiver that flips to `true` when the router is released.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Run a background task that is aborted on release.
    pub fn spawn_task<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track([tokio::spawn(fut)]);
    }

    fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }

    /// Send a repeatable message routed through the tree.
    pub fn send(&self, to: &str, key: &str, value: impl Into<Value>) -> Option<String> {
        self.send_opts(Address::from(to), key, value, SendOptions::default())
    }

    pub fn send_opts(
        &self,
        to: impl Into<Address>,
        key: &str,
        value: impl Into<Value>,
        opts: SendOptions,
    ) -> Option<String> {
        let msg = self.compose(to.into(), key, value.into(), &opts)?;
        self.send_message(&msg)
    }

    /// Send a repeatable message to the parent on the parent channel.
    pub fn push(&self, key: &str, value: impl Into<Value>) -> Option<String> {
        self.push_opts(key, value, SendOptions::default())
    }

    pub fn push_opts(&self, key: &str, value: impl Into<Value>, opts: SendOptions) -> Option<String> {
        let Some(parent) = &self.inner.parent else {
            error!(router = %self.inner.id, key = %key, "Push without a parent channel");
            return None;
        };
        let msg = self.compose(Address::from(parent.id()), key, value.into(), &opts)?;
        let bytes = self.encode(&msg)?;
        let frame = Frame::new(bytes);
        if let Some(line) = msg.summary() {
            debug!(router = %self.inner.id, "PUSH {line}");
        }
        if is_repeatable(&msg) {
            self.inner
                .parent_outbox
                .insert(msg.id(), msg.ttl(), parent.id(), frame.clone());
        }
        if !parent.send(frame) {
            warn!(router = %self.inner.id, parent = %parent.id(), "Parent channel closed");
        }
        Some(msg.id().to_string())
    }

    /// Send the same message to every directly connected peer.
    pub fn broadcast(&self, key: &str, value: impl Into<Value>, opts: SendOptions) -> Vec<String> {
        let value = value.into();
        self.inner
            .registry
            .peer_ids()
            .into_iter()
            .filter_map(|peer| self.send_opts(peer, key, value.clone(), opts.clone()))
            .collect()
    }

    /// Resolves once the router has been released.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stop the loops and close every channel. Pending retries are
    /// abandoned; handlers already running finish on their own.
    pub fn release(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.registry.clear();
        self.inner.peer_outbox.clear();
        self.inner.parent_outbox.clear();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!(router = %self.inner.id, "Router released");
    }

    fn compose(&self, to: Address, key: &str, value: Value, opts: &SendOptions) -> Option<Message> {
        if self.is_closing() {
            warn!(router = %self.inner.id, key = %key, "Send on a released router ignored");
            return None;
        }
        let id = format!(
            "{}_{}",
            self.inner.id,
            self.inner.counter.fetch_add(1, Ordering::Relaxed)
        );
        Some(compose(id, to, &self.inner.id, key, value, self.inner.config.ttl, opts))
    }

    fn encode(&self, msg: &Message) -> Option<bytes::Bytes> {
        match msg.serialize() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(router = %self.inner.id, key = %msg.key(), error = %e, "Refusing to send invalid message");
                None
            }
        }
    }

    fn send_message(&self, msg: &Message) -> Option<String> {
        let bytes = self.encode(msg)?;
        let (dest, frame) = outgoing_frame(msg, bytes, &self.inner.id);
        if let Some(line) = msg.summary() {
            debug!(router = %self.inner.id, via = %dest, "SENT {line}");
        }

        if frame.hops.is_empty() && is_own_id(&dest, &self.inner.id) {
            let _ = self.inner.loopback.send((Origin::Local, frame));
            return Some(msg.id().to_string());
        }

        match self.transmit(&dest, frame.clone()) {
            Some(channel) if is_repeatable(msg) => {
                let outbox = match channel {
                    Channel::Listener => &self.inner.peer_outbox,
                    Channel::Parent => &self.inner.parent_outbox,
                };
                outbox.insert(msg.id(), msg.ttl(), &dest, frame);
            }
            Some(_) => {}
            None => {
                error!(router = %self.inner.id, id = %msg.id(), dest = %dest, "Unroutable message dropped");
            }
        }
        Some(msg.id().to_string())
    }

    /// Put a frame toward `dest`: a known peer first, the parent otherwise.
    fn transmit(&self, dest: &str, frame: Frame) -> Option<Channel> {
        if self.inner.registry.route(dest, frame.clone()).is_some() {
            return Some(Channel::Listener);
        }
        match &self.inner.parent {
            Some(parent) if parent.send(frame) => Some(Channel::Parent),
            _ => None,
        }
    }

    fn handle_frame(&self, origin: Origin, mut frame: Frame) {
        let msg = match Message::deserialize(frame.body.clone(), false) {
            Ok(msg) => msg,
            Err(e) => {
                error!(router = %self.inner.id, origin = ?origin, error = %e, "Malformed message dropped");
                return;
            }
        };
        if let Err(e) = msg.validate() {
            error!(router = %self.inner.id, origin = ?origin, error = %e, "Invalid message dropped");
            return;
        }
        if let Origin::Peer(via) = &origin {
            if self.inner.registry.observe(msg.sender(), via) {
                info!(router = %self.inner.id, sender = %msg.sender(), via = %via, "First contact");
            }
        }

        frame.consume_own_hops(&self.inner.id);
        match frame.hops.first().cloned() {
            None if is_own_id(msg.recipient(), &self.inner.id) => self.handle_local(msg),
            Some(dest) => self.forward(&dest, frame, &origin, &msg),
            None => {
                let dest = msg.recipient().to_string();
                self.forward(&dest, frame, &origin, &msg)
            }
        }
    }

    /// Relay a frame untouched toward `dest`.
    fn forward(&self, dest: &str, frame: Frame, origin: &Origin, msg: &Message) {
        if let Some(line) = msg.summary() {
            debug!(router = %self.inner.id, via = %dest, "FORWARD {line}");
        }
        if self.inner.registry.route(dest, frame.clone()).is_some() {
            return;
        }
        if let Some(parent) = &self.inner.parent {
            if *origin != Origin::Upstream && parent.send(frame) {
                return;
            }
        }
        error!(
            router = %self.inner.id,
            id = %msg.id(),
            dest = %dest,
            sender = %msg.sender(),
            "Unroutable message dropped"
        );
    }

    fn handle_local(&self, mut msg: Message) {
        if self.inner.config.expand_arrays {
            if let Err(e) = msg.expand_arrays() {
                error!(router = %self.inner.id, id = %msg.id(), error = %e, "Array payload could not be decoded");
                return;
            }
        }
        if let Some(line) = msg.summary() {
            debug!(router = %self.inner.id, "RECV {line}");
        }

        match msg.key() {
            keys::CONFIRM => {
                if let Some(confirmed) = msg.value().as_str() {
                    if self.inner.peer_outbox.confirm(confirmed)
                        || self.inner.parent_outbox.confirm(confirmed)
                    {
                        debug!(router = %self.inner.id, id = %confirmed, "Confirmed");
                    }
                }
                return;
            }
            keys::KILL => {
                info!(router = %self.inner.id, sender = %msg.sender(), "KILL received");
                self.release();
                return;
            }
            keys::STREAM => match unwrap_batch(msg.value().clone()) {
                Some((inner_key, items)) => {
                    for item in items {
                        let unwrapped = Message::new(
                            msg.id(),
                            msg.to().clone(),
                            msg.sender(),
                            inner_key.as_str(),
                            item,
                        )
                        .with_flags(msg.flags().iter().copied());
                        self.dispatch(unwrapped);
                    }
                }
                None => error!(router = %self.inner.id, id = %msg.id(), "Malformed STREAM payload"),
            },
            _ => self.dispatch(msg.clone()),
        }

        if !msg.has_flag(Flag::NoRepeat) {
            let opts = SendOptions::no_repeat().with_flag(Flag::MinPrint);
            self.send_opts(msg.sender(), keys::CONFIRM, msg.id(), opts);
        }
    }

    fn dispatch(&self, msg: Message) {
        match self.inner.routes.get(msg.key()) {
            Some(handler) => {
                let router = self.clone();
                let key = msg.key().to_string();
                self.inner.pool.run(&key, move || handler.handle(&router, msg));
            }
            None => error!(router = %self.inner.id, key = %msg.key(), sender = %msg.sender(), "No route handler for key"),
        }
    }
}

async fn run_loop(
    router: Router,
    mut inbound: mpsc::UnboundedReceiver<(Origin, Frame)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Some((origin, frame)) => router.handle_frame(origin, frame),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
        if router.is_closing() {
            break;
        }
    }
    debug!(router = %router.inner.id, "I/O loop stopped");
}
