//! Configuration for nodes and routers.
//!
//! Every field has a default, so a partial TOML table is enough to bring up
//! an endpoint.

use crate::message::DEFAULT_TTL;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default retry scan interval.
pub const DEFAULT_REPEAT_INTERVAL_MS: u64 = 5_000;
/// Default size of the handler worker pool.
pub const DEFAULT_MAX_HANDLERS: usize = 16;
/// Default router port.
pub const DEFAULT_ROUTER_PORT: u16 = 5560;
/// Default interval between agent liveness pushes.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Default capacity of a streaming producer queue.
pub const DEFAULT_STREAM_QUEUE: usize = 1024;

/// Where an endpoint's point-to-point channel connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Id of the upstream peer, used when `to` is omitted.
    pub id: String,
    /// `host:port` of the upstream peer's listener.
    pub addr: String,
}

/// Configuration for a node endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id.
    pub id: String,
    /// Router (or node) that unaddressed traffic goes to.
    pub upstream: Option<UpstreamConfig>,
    /// Bind an inbound listener here to be addressed directly.
    pub listen: Option<SocketAddr>,
    /// Decode packed arrays before handing values to listens.
    pub expand_arrays: bool,
    /// Retry scan interval in milliseconds.
    pub repeat_interval_ms: u64,
    /// Retries before a message is given up on.
    pub ttl: i32,
    /// Maximum concurrently running listen handlers.
    pub max_handlers: usize,
    /// Capacity of each streaming producer queue.
    pub stream_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: format!("node-{}", short_id()),
            upstream: None,
            listen: None,
            expand_arrays: true,
            repeat_interval_ms: DEFAULT_REPEAT_INTERVAL_MS,
            ttl: DEFAULT_TTL,
            max_handlers: DEFAULT_MAX_HANDLERS,
            stream_queue: DEFAULT_STREAM_QUEUE,
        }
    }
}

impl NodeConfig {
    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_ms)
    }
}

/// Configuration for a router.
///
/// A coordinator has no `parent`; an agent has one. `file_root`,
/// `continuous_hz` and `heartbeat_interval_ms` switch on the optional
/// behaviours of each profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// This router's id.
    pub id: String,
    /// Address of the inbound multiplexing listener.
    pub listen: SocketAddr,
    /// Parent router, absent at the tree root.
    pub parent: Option<UpstreamConfig>,
    /// Decode packed arrays for locally dispatched messages.
    pub expand_arrays: bool,
    /// Retry scan interval in milliseconds.
    pub repeat_interval_ms: u64,
    /// Retries before a message is given up on.
    pub ttl: i32,
    /// Maximum concurrently running listen handlers.
    pub max_handlers: usize,
    /// Directory files are served from (coordinator) or saved to (agent).
    pub file_root: Option<PathBuf>,
    /// Maximum CONTINUOUS fan-out rate per consumer, in Hz.
    pub continuous_hz: Option<f64>,
    /// Consumers CONTINUOUS data is relayed to. Defaults to the parent.
    pub continuous_consumers: Vec<String>,
    /// Interval between liveness pushes to the parent, in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            id: format!("router-{}", short_id()),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_ROUTER_PORT)),
            parent: None,
            expand_arrays: false,
            repeat_interval_ms: DEFAULT_REPEAT_INTERVAL_MS,
            ttl: DEFAULT_TTL,
            max_handlers: DEFAULT_MAX_HANDLERS,
            file_root: None,
            continuous_hz: None,
            continuous_consumers: Vec::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl RouterConfig {
    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
