//! Coordinator: the router at the root of the tree.
//!
//! Adds a device table fed by `PING`, `STATE` and `HANDSHAKE` (agent
//! `{id, state}` reports are booked under the reporting device), a file
//! responder for `FILE` requests, and `HEALTH` fan-out probing every
//! connected peer.

use crate::agent::parse_state_report;
use crate::error::{WireError, WireResult};
use crate::files;
use crate::node::SendOptions;
use crate::router::{RouteTable, Router};
use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use fieldmesh_types::{keys, Flag, Message, RouterConfig, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What the coordinator knows about a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    /// Last reported state, if any.
    pub state: Option<String>,
    /// Last time any traffic was handled from the device.
    pub last_seen: DateTime<Utc>,
    /// Listen address announced in the device's handshake.
    pub listen: Option<String>,
}

impl DeviceStatus {
    fn new() -> Self {
        Self {
            state: None,
            last_seen: Utc::now(),
            listen: None,
        }
    }
}

type Devices = Arc<DashMap<String, DeviceStatus>>;

fn touch<'a>(devices: &'a Devices, id: &str) -> RefMut<'a, String, DeviceStatus> {
    let mut entry = devices
        .entry(id.to_string())
        .or_insert_with(DeviceStatus::new);
    entry.last_seen = Utc::now();
    entry
}

/// A running coordinator.
#[derive(Debug, Clone)]
pub struct Coordinator {
    router: Router,
    devices: Devices,
}

impl Coordinator {
    /// Start the coordinator. `extra` handlers take precedence over the
    /// built-in ones for the same key.
    pub async fn start(config: RouterConfig, extra: RouteTable) -> WireResult<Coordinator> {
        if config.parent.is_some() {
            return Err(WireError::Config(
                "the coordinator is the tree root and takes no parent".into(),
            ));
        }
        let devices: Devices = Arc::new(DashMap::new());
        let routes = extra.merge(builtin_routes(Arc::clone(&devices), config.file_root.clone()));
        let router = Router::start(config, routes).await?;
        Ok(Coordinator { router, devices })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Probe every connected peer with a `PING`. Returns how many were sent.
    pub fn check_health(&self) -> usize {
        probe(&self.router)
    }

    /// Snapshot of the device table, sorted by id.
    pub fn devices(&self) -> Vec<(String, DeviceStatus)> {
        let mut devices: Vec<(String, DeviceStatus)> = self
            .devices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        devices
    }

    pub fn device(&self, id: &str) -> Option<DeviceStatus> {
        self.devices.get(id).map(|entry| entry.value().clone())
    }

    pub fn release(&self) {
        self.router.release();
    }

    pub async fn closed(&self) {
        self.router.closed().await
    }
}

fn probe(router: &Router) -> usize {
    let opts = SendOptions::no_repeat().with_flag(Flag::MinPrint);
    let sent = router.broadcast(keys::PING, Value::Null, opts);
    info!(router = %router.id(), peers = sent.len(), "Health check sent");
    sent.len()
}

fn builtin_routes(devices: Devices, file_root: Option<PathBuf>) -> RouteTable {
    let on_ping = Arc::clone(&devices);
    let on_state = Arc::clone(&devices);
    let on_handshake = devices;

    RouteTable::new()
        .on(keys::PING, move |_router: &Router, msg: Message| {
            touch(&on_ping, msg.sender());
        })
        .on(keys::STATE, move |_router: &Router, msg: Message| {
            let (device, state) = match parse_state_report(msg.value()) {
                Some((device, state)) => (device.to_string(), state.to_string()),
                None => match msg.value() {
                    Value::Str(state) => (msg.sender().to_string(), state.clone()),
                    other => (msg.sender().to_string(), other.to_string()),
                },
            };
            info!(device = %device, state = %state, "Device state changed");
            touch(&on_state, &device).state = Some(state);
        })
        .on(keys::HANDSHAKE, move |_router: &Router, msg: Message| {
            let id = msg
                .value()
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(msg.sender())
                .to_string();
            let listen = msg
                .value()
                .get("listen")
                .and_then(Value::as_str)
                .map(str::to_string);
            info!(device = %id, listen = ?listen, "Handshake");
            touch(&on_handshake, &id).listen = listen;
        })
        .on(keys::FILE, move |router: &Router, msg: Message| {
            let Some(root) = &file_root else {
                warn!(router = %router.id(), sender = %msg.sender(), "FILE request but no file_root configured");
                return;
            };
            let Some(rel) = msg.value().get(files::PATH_FIELD).and_then(Value::as_str) else {
                error!(router = %router.id(), sender = %msg.sender(), "FILE request without a path");
                return;
            };
            match files::load(root, rel) {
                Ok(reply) => {
                    info!(router = %router.id(), path = %rel, to = %msg.sender(), "Serving file");
                    router.send(msg.sender(), keys::FILE, reply);
                }
                Err(e) => warn!(router = %router.id(), path = %rel, error = %e, "Cannot serve file"),
            }
        })
        .on(keys::HEALTH, |router: &Router, _msg: Message| {
            probe(router);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldmesh_types::UpstreamConfig;

    #[tokio::test]
    async fn test_coordinator_rejects_parent() {
        let config = RouterConfig {
            id: "coordinator".into(),
            listen: "127.0.0.1:0".parse().unwrap(),
            parent: Some(UpstreamConfig {
                id: "above".into(),
                addr: "127.0.0.1:1".into(),
            }),
            ..RouterConfig::default()
        };
        let err = Coordinator::start(config, RouteTable::new()).await.unwrap_err();
        assert!(matches!(err, WireError::Config(_)));
    }

    #[test]
    fn test_touch_creates_and_updates() {
        let devices: Devices = Arc::new(DashMap::new());
        touch(&devices, "rig-1").state = Some("RUNNING".into());
        let first = devices.get("rig-1").unwrap().last_seen;
        touch(&devices, "rig-1");
        let status = devices.get("rig-1").unwrap().clone();
        assert_eq!(status.state.as_deref(), Some("RUNNING"));
        assert!(status.last_seen >= first);
    }

    #[tokio::test]
    async fn test_health_check_without_peers() {
        let config = RouterConfig {
            id: "coordinator".into(),
            listen: "127.0.0.1:0".parse().unwrap(),
            ..RouterConfig::default()
        };
        let coordinator = Coordinator::start(config, RouteTable::new()).await.unwrap();
        assert_eq!(coordinator.check_health(), 0);
        assert!(coordinator.devices().is_empty());
        coordinator.release();
    }
}
