//! Outbox of sent-but-unconfirmed messages and its retry loop.
//!
//! An entry holds the exact frame that went out. Retrying re-sends those
//! bytes unchanged; the remaining retry budget lives on the entry, not in the
//! message.

use crate::frame::Frame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A message awaiting confirmation.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// When the message was first sent.
    pub sent_at: Instant,
    /// Retries left.
    pub ttl: i32,
    /// Where to send it again.
    pub dest: String,
    /// The frame as originally transmitted.
    pub frame: Frame,
}

/// Result of one retry scan.
#[derive(Debug, Default)]
pub struct Scan {
    /// `(dest, frame)` pairs to transmit again.
    pub resend: Vec<(String, Frame)>,
    /// Ids dropped because their TTL ran out.
    pub expired: Vec<String>,
}

/// Pending messages keyed by message id.
#[derive(Debug, Clone)]
pub struct Outbox {
    name: &'static str,
    entries: Arc<Mutex<HashMap<String, OutboxEntry>>>,
}

impl Outbox {
    /// `name` labels the outbox in log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn insert(&self, id: &str, ttl: i32, dest: &str, frame: Frame) {
        let entry = OutboxEntry {
            sent_at: Instant::now(),
            ttl,
            dest: dest.to_string(),
            frame,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(id.to_string(), entry);
    }

    /// Retire the entry for `id`. Returns false if nothing was pending.
    pub fn confirm(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every pending entry.
    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Abandon everything pending.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Decide what to do with entries sent more than `older_than` before `now`.
    ///
    /// Works on a snapshot so sends and confirmations racing with the scan
    /// are never blocked behind it. Entries confirmed while the scan runs are
    /// left alone.
    pub fn scan(&self, older_than: Duration, now: Instant) -> Scan {
        let snapshot: Vec<(String, OutboxEntry)> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let mut scan = Scan::default();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (id, seen) in snapshot {
            if now.saturating_duration_since(seen.sent_at) <= older_than {
                continue;
            }
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            if entry.ttl <= 0 {
                entries.remove(&id);
                warn!(outbox = self.name, id = %id, dest = %seen.dest, "Delivery failed: TTL exhausted without confirmation");
                scan.expired.push(id);
            } else {
                entry.ttl -= 1;
                debug!(outbox = self.name, id = %id, ttl = entry.ttl, "Resending unconfirmed message");
                scan.resend.push((entry.dest.clone(), entry.frame.clone()));
            }
        }
        scan
    }
}

/// Run `outbox.scan` every `interval` until `shutdown` fires, passing each
/// due frame to `resend`. Entries become due after twice the interval.
pub fn spawn_retry_loop<F>(
    outbox: Outbox,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    resend: F,
) -> JoinHandle<()>
where
    F: Fn(&str, Frame) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scan = outbox.scan(interval * 2, Instant::now());
                    for (dest, frame) in scan.resend {
                        resend(&dest, frame);
                    }
                }
                _ = shutdown.changed() => {
                    debug!(outbox = outbox.name, "Retry loop stopped");
                    break;
                }
            }
        }
    })
}
