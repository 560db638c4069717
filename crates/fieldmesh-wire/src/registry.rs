//! Peer registry: connected peers, the first-contact book and the route cache.
//!
//! The [`PeerRegistry`] is shared between an endpoint's I/O loop, its accept
//! loop and its retry task. Every accessor takes the lock briefly and hands
//! back owned snapshots, so no caller iterates over live state.

use crate::frame::Frame;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A live connection on the multiplexing listener.
#[derive(Debug, Clone)]
pub struct PeerLink {
    /// Identity the peer announced.
    pub id: String,
    /// Remote socket address.
    pub address: SocketAddr,
    /// Bounded queue drained by the connection's writer task.
    pub tx: mpsc::Sender<Frame>,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Distinguishes reconnections under the same id.
    pub conn: u64,
}

/// What the registry remembers about a sender it has seen traffic from.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderEntry {
    /// Connection the sender's traffic last arrived through.
    pub via: String,
    /// When the sender was first seen.
    pub first_seen: DateTime<Utc>,
    /// When the sender was last seen.
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<String, PeerLink>,
    senders: HashMap<String, SenderEntry>,
}

/// Thread-safe registry of peers and routes.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any older link under the same id.
    pub fn add_peer(&self, link: PeerLink) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.peers.insert(link.id.clone(), link);
    }

    /// Remove a connection, unless it has already been replaced by a newer
    /// one. Senders last seen through it are forgotten as well.
    pub fn remove_peer(&self, id: &str, conn: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.peers.get(id).map(|p| p.conn) == Some(conn) {
            inner.peers.remove(id);
            let before = inner.senders.len();
            inner.senders.retain(|_, entry| entry.via != id);
            debug!(peer = %id, forgotten = before - inner.senders.len(), "Route cache pruned");
        }
    }

    /// Drop every connection and route. Writer tasks end once their queue
    /// closes.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.peers.clear();
        inner.senders.clear();
    }

    pub fn known_senders(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.senders.len()
    }

    pub fn is_connected(&self, id: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.peers.contains_key(id)
    }

    /// Ids of all directly connected peers.
    pub fn peer_ids(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = inner.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Record traffic from `sender` arriving through connection `via`.
    ///
    /// Returns true the first time `sender` is seen.
    pub fn observe(&self, sender: &str, via: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.senders.get_mut(sender) {
            Some(entry) => {
                entry.via = via.to_string();
                entry.last_seen = now;
                false
            }
            None => {
                inner.senders.insert(
                    sender.to_string(),
                    SenderEntry {
                        via: via.to_string(),
                        first_seen: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn sender(&self, id: &str) -> Option<SenderEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.senders.get(id).cloned()
    }

    /// The connected peer that leads to `dest`: the peer itself when it is
    /// directly connected, else the connection its traffic last came through.
    pub fn next_hop(&self, dest: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.peers.contains_key(dest) {
            return Some(dest.to_string());
        }
        inner
            .senders
            .get(dest)
            .filter(|entry| inner.peers.contains_key(&entry.via))
            .map(|entry| entry.via.clone())
    }

    /// Queue a frame on a directly connected peer's link. A full queue
    /// drops the frame.
    pub fn send_to(&self, peer: &str, frame: Frame) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(link) = inner.peers.get(peer) else {
            return false;
        };
        match link.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %peer, queued = link.tx.max_capacity(), "Peer write queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Route `frame` toward `dest` over the listener. Returns the hop used.
    pub fn route(&self, dest: &str, frame: Frame) -> Option<String> {
        let hop = self.next_hop(dest)?;
        self.send_to(&hop, frame).then_some(hop)
    }
}
