//! Node: the embeddable messaging endpoint.
//!
//! A node holds an optional point-to-point channel to its upstream peer and
//! an optional multiplexing listener through which it can be addressed
//! directly. Received messages go through one I/O loop that confirms,
//! unwraps streams and hands values to the listen table's handlers on the
//! worker pool.

use crate::dispatch::{Listens, WorkerPool};
use crate::error::{WireError, WireResult};
use crate::frame::{is_own_id, Frame};
use crate::outbox::{spawn_retry_loop, Outbox};
use crate::registry::PeerRegistry;
use crate::stream::{spawn_stream, unwrap_batch, Outgoing, StreamHandle};
use crate::transport::{self, Origin, Upstream};
use fieldmesh_types::{keys, Address, Flag, Message, NodeConfig, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-send delivery options.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Keep the message in the outbox until confirmed. Unset adds `NOREPEAT`.
    pub repeat: bool,
    /// Extra flags for the message.
    pub flags: Vec<Flag>,
    /// Override the configured retry budget.
    pub ttl: Option<i32>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            repeat: true,
            flags: Vec::new(),
            ttl: None,
        }
    }
}

impl SendOptions {
    /// Fire-and-forget: no outbox entry, no confirmation.
    pub fn no_repeat() -> Self {
        Self {
            repeat: false,
            ..Self::default()
        }
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }
}

/// Stamp a fresh message with the options applied.
pub(crate) fn compose(
    id: String,
    to: Address,
    sender: &str,
    key: &str,
    value: Value,
    default_ttl: i32,
    opts: &SendOptions,
) -> Message {
    let mut msg = Message::new(id, to, sender, key, value)
        .with_ttl(opts.ttl.unwrap_or(default_ttl))
        .with_flags(opts.flags.iter().copied());
    if !opts.repeat {
        msg.set_flag(Flag::NoRepeat);
    }
    msg
}

/// Whether sending `msg` should create an outbox entry.
pub(crate) fn is_repeatable(msg: &Message) -> bool {
    !msg.has_flag(Flag::NoRepeat) && msg.key() != keys::CONFIRM
}

/// Build the frame for `msg`: explicit path hops travel as frame parts.
/// Returns the frame and the id of the first hop to send it to.
pub(crate) fn outgoing_frame(msg: &Message, bytes: bytes::Bytes, own_id: &str) -> (String, Frame) {
    let mut frame = Frame::with_hops(msg.to().hops().to_vec(), bytes);
    frame.consume_own_hops(own_id);
    let dest = frame
        .hops
        .first()
        .cloned()
        .unwrap_or_else(|| msg.recipient().to_string());
    (dest, frame)
}

struct NodeInner {
    id: String,
    config: NodeConfig,
    listens: Listens,
    upstream: Option<Upstream>,
    registry: PeerRegistry,
    outbox: Outbox,
    pool: WorkerPool,
    counter: AtomicU64,
    local_addr: Option<SocketAddr>,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A messaging endpoint. Cheap to clone; all clones share one endpoint.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("upstream", &self.inner.upstream.as_ref().map(Upstream::id))
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

impl Node {
    /// Connect upstream and/or bind the listener, then start the I/O loop
    /// and the retry loop.
    ///
    /// Bind and connect failures are returned; nothing is left running.
    pub async fn start(config: NodeConfig, listens: Listens) -> WireResult<Node> {
        if config.upstream.is_none() && config.listen.is_none() {
            return Err(WireError::Config(format!(
                "node '{}' needs an upstream or a listen address",
                config.id
            )));
        }
        if config.id.is_empty() {
            return Err(WireError::Config("node id must not be empty".into()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new();
        let mut tasks = Vec::new();

        let mut local_addr = None;
        if let Some(addr) = config.listen {
            let (bound, handle) = transport::listen(
                addr,
                &config.id,
                registry.clone(),
                inbound_tx.clone(),
                shutdown_rx.clone(),
            )
            .await?;
            local_addr = Some(bound);
            tasks.push(handle);
        }

        let mut upstream = None;
        if let Some(up) = &config.upstream {
            match transport::dial(&config.id, up, inbound_tx.clone(), shutdown_rx.clone()).await {
                Ok((channel, handles)) => {
                    upstream = Some(channel);
                    tasks.extend(handles);
                }
                Err(e) => {
                    let _ = shutdown_tx.send(true);
                    return Err(e);
                }
            }
        }
        drop(inbound_tx);

        let inner = Arc::new(NodeInner {
            id: config.id.clone(),
            pool: WorkerPool::new(config.max_handlers),
            config,
            listens,
            upstream,
            registry,
            outbox: Outbox::new("node"),
            counter: AtomicU64::new(0),
            local_addr,
            closing: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        tasks.push(tokio::spawn(run_loop(
            Arc::clone(&inner),
            inbound_rx,
            shutdown_rx.clone(),
        )));

        let weak = Arc::downgrade(&inner);
        tasks.push(spawn_retry_loop(
            inner.outbox.clone(),
            inner.config.repeat_interval(),
            shutdown_rx,
            move |dest, frame| {
                if let Some(inner) = weak.upgrade() {
                    inner.transmit(dest, frame);
                }
            },
        ));

        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        info!(node = %inner.id, listen = ?inner.local_addr, "Node started");
        Ok(Node { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Address the listener is bound to, when one was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Send a repeatable message. `to` defaults to the upstream id.
    ///
    /// Returns the message id, or `None` when nothing could be built; the
    /// reason is logged.
    pub fn send(&self, to: Option<&str>, key: &str, value: impl Into<Value>) -> Option<String> {
        self.send_opts(to.map(Address::from), key, value, SendOptions::default())
    }

    pub fn send_opts(
        &self,
        to: Option<Address>,
        key: &str,
        value: impl Into<Value>,
        opts: SendOptions,
    ) -> Option<String> {
        self.inner.send_opts(to, key, value.into(), &opts)
    }

    /// Start a streaming producer for `key`.
    ///
    /// With `min_batch <= 1` every sample goes out as its own `key` message;
    /// otherwise samples accumulate into `STREAM` batches of at least
    /// `min_batch`. Stream traffic is never retried.
    pub fn get_stream(&self, key: &str, min_batch: usize, to: Option<&str>) -> StreamHandle {
        let dest: Option<Address> = to.map(Address::from);
        let weak: Weak<NodeInner> = Arc::downgrade(&self.inner);
        let stream_key = key.to_string();
        let (handle, task) = spawn_stream(
            key,
            &self.inner.id,
            min_batch,
            self.inner.config.stream_queue,
            self.inner.shutdown_tx.subscribe(),
            move |out| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let opts = SendOptions::no_repeat().with_flag(Flag::MinPrint);
                match out {
                    Outgoing::Single(value) => {
                        inner.send_opts(dest.clone(), &stream_key, value, &opts);
                    }
                    Outgoing::Batch(value) => {
                        inner.send_opts(dest.clone(), keys::STREAM, value, &opts);
                    }
                }
            },
        );
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        handle
    }

    /// Ids of messages still awaiting confirmation.
    pub fn pending(&self) -> Vec<String> {
        self.inner.outbox.ids()
    }

    /// Peers connected to this node's listener.
    pub fn known_peers(&self) -> Vec<String> {
        self.inner.registry.peer_ids()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Stop the loops and close every channel. Pending retries are
    /// abandoned; handlers already running finish on their own.
    pub fn release(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.registry.clear();
        self.inner.outbox.clear();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!(node = %self.inner.id, "Node released");
    }
}

impl NodeInner {
    fn next_id(&self) -> String {
        format!("{}_{}", self.id, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn send_opts(&self, to: Option<Address>, key: &str, value: Value, opts: &SendOptions) -> Option<String> {
        if self.closing.load(Ordering::SeqCst) {
            warn!(node = %self.id, key = %key, "Send on a released node ignored");
            return None;
        }
        let to = match to.or_else(|| self.upstream.as_ref().map(|up| Address::from(up.id()))) {
            Some(to) => to,
            None => {
                error!(node = %self.id, key = %key, "No destination and no upstream configured");
                return None;
            }
        };
        let msg = compose(self.next_id(), to, &self.id, key, value, self.config.ttl, opts);
        self.send_message(&msg)
    }

    fn send_message(&self, msg: &Message) -> Option<String> {
        let bytes = match msg.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(node = %self.id, key = %msg.key(), error = %e, "Refusing to send invalid message");
                return None;
            }
        };
        let (dest, frame) = outgoing_frame(msg, bytes, &self.id);
        if let Some(line) = msg.summary() {
            debug!(node = %self.id, via = %dest, "SENT {line}");
        }
        if is_repeatable(msg) {
            self.outbox.insert(msg.id(), msg.ttl(), &dest, frame.clone());
        }
        self.transmit(&dest, frame);
        Some(msg.id().to_string())
    }

    /// Put a frame on the best channel toward `dest`: a direct or cached
    /// route on the listener first, the upstream channel otherwise.
    fn transmit(&self, dest: &str, frame: Frame) -> bool {
        if self.registry.route(dest, frame.clone()).is_some() {
            return true;
        }
        match &self.upstream {
            Some(upstream) if upstream.send(frame) => true,
            _ => {
                warn!(node = %self.id, dest = %dest, "No channel toward destination");
                false
            }
        }
    }

    fn handle_frame(&self, origin: Origin, mut frame: Frame) {
        let mut msg = match Message::deserialize(frame.body.clone(), false) {
            Ok(msg) => msg,
            Err(e) => {
                error!(node = %self.id, origin = ?origin, error = %e, "Malformed message dropped");
                return;
            }
        };
        if let Err(e) = msg.validate() {
            error!(node = %self.id, origin = ?origin, error = %e, "Invalid message dropped");
            return;
        }
        if let Origin::Peer(via) = &origin {
            if self.registry.observe(msg.sender(), via) {
                info!(node = %self.id, sender = %msg.sender(), via = %via, "First contact");
            }
        }

        frame.consume_own_hops(&self.id);
        if let Some(next) = frame.hops.first() {
            error!(node = %self.id, id = %msg.id(), next = %next, "Nodes do not forward; dropping multi-hop message");
            return;
        }
        if !is_own_id(msg.recipient(), &self.id) {
            error!(node = %self.id, id = %msg.id(), to = %msg.to(), "Message not addressed to this node");
            return;
        }
        if self.config.expand_arrays {
            if let Err(e) = msg.expand_arrays() {
                error!(node = %self.id, id = %msg.id(), error = %e, "Array payload could not be decoded");
                return;
            }
        }
        if let Some(line) = msg.summary() {
            debug!(node = %self.id, "RECV {line}");
        }

        match msg.key() {
            keys::CONFIRM => {
                if let Some(confirmed) = msg.value().as_str() {
                    if self.outbox.confirm(confirmed) {
                        debug!(node = %self.id, id = %confirmed, "Confirmed");
                    }
                }
                return;
            }
            keys::STREAM => match unwrap_batch(msg.value().clone()) {
                Some((inner_key, items)) => {
                    for item in items {
                        self.dispatch(&inner_key, item);
                    }
                }
                None => error!(node = %self.id, id = %msg.id(), "Malformed STREAM payload"),
            },
            key => self.dispatch(key, msg.value().clone()),
        }

        if !msg.has_flag(Flag::NoRepeat) {
            self.confirm(&msg);
        }
    }

    fn dispatch(&self, key: &str, value: Value) {
        match self.listens.get(key) {
            Some(handler) => self.pool.run(key, move || handler.handle(value)),
            None => error!(node = %self.id, key = %key, "No listen registered for key"),
        }
    }

    fn confirm(&self, msg: &Message) {
        let opts = SendOptions::no_repeat().with_flag(Flag::MinPrint);
        self.send_opts(
            Some(Address::from(msg.sender())),
            keys::CONFIRM,
            Value::from(msg.id()),
            &opts,
        );
    }
}

async fn run_loop(
    inner: Arc<NodeInner>,
    mut inbound: mpsc::UnboundedReceiver<(Origin, Frame)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Some((origin, frame)) => inner.handle_frame(origin, frame),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(node = %inner.id, "I/O loop stopped");
}
