//! Agent: the router running on a remote device.
//!
//! An agent always has a parent. It announces itself with a `HANDSHAKE`,
//! pushes a liveness `PING` on a fixed interval, keeps its own state,
//! answers parent probes with that state and relays `CONTINUOUS` data to its
//! consumers, decimated to the configured rate.
//!
//! State travels upward as a `{id, state}` report. A plain `STATE` value
//! comes from a local task and sets the agent's own state; a report comes
//! from a nested agent and is passed on to the parent untouched, as are
//! nested handshakes.

use crate::error::{WireError, WireResult};
use crate::files;
use crate::node::SendOptions;
use crate::relay::ContinuousRelay;
use crate::router::{RouteTable, Router};
use fieldmesh_types::{keys, Flag, Message, RouterConfig, Value};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// State an agent reports before anything sets it.
pub const INITIAL_STATE: &str = "IDLE";

/// Build the `{id, state}` report an agent sends upward.
pub fn state_report(id: &str, state: &str) -> Value {
    Value::map([("id", Value::from(id)), ("state", Value::from(state))])
}

/// Split a `{id, state}` report. Plain state values yield `None`.
pub fn parse_state_report(value: &Value) -> Option<(&str, &str)> {
    let id = value.get("id")?.as_str()?;
    let state = value.get("state")?.as_str()?;
    Some((id, state))
}

/// A running agent router.
#[derive(Debug, Clone)]
pub struct Agent {
    router: Router,
    state: Arc<RwLock<String>>,
    relay: Option<Arc<ContinuousRelay>>,
}

impl Agent {
    /// Start the agent and announce it to its parent. `extra` handlers take
    /// precedence over the built-in ones for the same key.
    pub async fn start(config: RouterConfig, extra: RouteTable) -> WireResult<Agent> {
        let Some(parent) = config.parent.clone() else {
            return Err(WireError::Config("an agent needs a parent".into()));
        };
        let state = Arc::new(RwLock::new(INITIAL_STATE.to_string()));
        let relay = config.continuous_hz.map(|hz| Arc::new(ContinuousRelay::new(hz)));
        let consumers = if config.continuous_consumers.is_empty() {
            vec![parent.id.clone()]
        } else {
            config.continuous_consumers.clone()
        };
        if let Some(relay) = &relay {
            for consumer in &consumers {
                relay.subscribe(consumer);
            }
        }

        let builtin = builtin_routes(
            Arc::clone(&state),
            parent.id.clone(),
            relay.clone(),
            consumers,
            config.file_root.clone(),
        );
        let heartbeat = config.heartbeat_interval();
        let router = Router::start(config, extra.merge(builtin)).await?;

        if let Some(relay) = &relay {
            router.spawn_task(Arc::clone(relay).run_timer(router.shutdown_signal()));
        }
        router.push(
            keys::HANDSHAKE,
            Value::map([
                ("id", Value::from(router.id())),
                ("listen", Value::from(router.local_addr().to_string())),
            ]),
        );
        if !heartbeat.is_zero() {
            router.spawn_task(heartbeat_loop(router.clone(), heartbeat));
        }

        info!(router = %router.id(), parent = %parent.id, "Agent started");
        Ok(Agent {
            router,
            state,
            relay,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn state(&self) -> String {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record a new state and report it to the parent.
    pub fn set_state(&self, state: &str) {
        set_state(&self.router, &self.state, Value::from(state));
    }

    /// Ask the parent for a file. The reply is saved beneath `file_root`.
    pub fn request_file(&self, path: &str) -> Option<String> {
        self.router
            .push(keys::FILE, Value::map([(files::PATH_FIELD, Value::from(path))]))
    }

    /// Consumers receiving relayed continuous data, when rate limiting is on.
    pub fn relay_consumers(&self) -> Vec<String> {
        self.relay
            .as_ref()
            .map(|relay| relay.consumers())
            .unwrap_or_default()
    }

    pub fn release(&self) {
        self.router.release();
    }

    pub async fn closed(&self) {
        self.router.closed().await
    }
}

fn set_state(router: &Router, state: &RwLock<String>, value: Value) {
    let text = match value {
        Value::Str(s) => s,
        other => other.to_string(),
    };
    router.push(keys::STATE, state_report(router.id(), &text));
    *state.write().unwrap_or_else(|e| e.into_inner()) = text;
}

async fn heartbeat_loop(router: Router, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if router.is_closing() {
            break;
        }
        let opts = SendOptions::no_repeat().with_flag(Flag::NoLog);
        router.push_opts(keys::PING, Value::Null, opts);
    }
}

fn builtin_routes(
    state: Arc<RwLock<String>>,
    parent_id: String,
    relay: Option<Arc<ContinuousRelay>>,
    consumers: Vec<String>,
    file_root: Option<PathBuf>,
) -> RouteTable {
    let on_ping = Arc::clone(&state);
    let on_state = state;

    RouteTable::new()
        .on(keys::PING, move |router: &Router, msg: Message| {
            // Nested agents' heartbeats end here.
            if msg.sender() != parent_id {
                return;
            }
            let current = on_ping.read().unwrap_or_else(|e| e.into_inner()).clone();
            router.send(msg.sender(), keys::STATE, state_report(router.id(), &current));
        })
        .on(keys::STATE, move |router: &Router, msg: Message| {
            if let Some((device, reported)) = parse_state_report(msg.value()) {
                if device != router.id() {
                    debug!(router = %router.id(), device = %device, state = %reported, "Passing nested state upward");
                    router.push(keys::STATE, msg.into_value());
                }
                return;
            }
            set_state(router, &on_state, msg.into_value());
        })
        .on(keys::HANDSHAKE, |router: &Router, msg: Message| {
            debug!(router = %router.id(), sender = %msg.sender(), "Passing nested handshake upward");
            router.push(keys::HANDSHAKE, msg.into_value());
        })
        .on(keys::CONTINUOUS, move |router: &Router, msg: Message| {
            let opts = SendOptions::no_repeat().with_flag(Flag::MinPrint);
            match &relay {
                Some(relay) => {
                    for consumer in relay.consumers() {
                        if relay.try_take(&consumer) {
                            router.send_opts(consumer.as_str(), keys::CONTINUOUS, msg.value().clone(), opts.clone());
                        } else {
                            debug!(router = %router.id(), consumer = %consumer, "Continuous sample decimated");
                        }
                    }
                }
                None => {
                    for consumer in &consumers {
                        router.send_opts(consumer.as_str(), keys::CONTINUOUS, msg.value().clone(), opts.clone());
                    }
                }
            }
        })
        .on(keys::FILE, move |router: &Router, msg: Message| {
            let Some(root) = &file_root else {
                warn!(router = %router.id(), "Received a file but no file_root configured");
                return;
            };
            match files::save(root, msg.value()) {
                Ok(path) => info!(router = %router.id(), path = %path.display(), "File saved"),
                Err(e) => warn!(router = %router.id(), error = %e, "Cannot save file"),
            }
        })
}
