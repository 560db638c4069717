//! Streaming producer: batches high-rate samples into `STREAM` messages.
//!
//! The producer side never blocks. The queue is bounded and drops its oldest
//! entry when full; a drain task empties it and hands batches to the owning
//! endpoint for transmission.

use fieldmesh_types::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Field naming the real key inside a `STREAM` value.
pub const INNER_KEY: &str = "inner_key";
/// Field carrying the batched items inside a `STREAM` value.
pub const PAYLOAD: &str = "payload";

#[derive(Debug)]
struct StreamQueue {
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Producer handle returned by `Node::get_stream`.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    key: String,
    queue: Arc<StreamQueue>,
}

impl StreamHandle {
    fn new(key: &str, capacity: usize) -> Self {
        Self {
            key: key.to_string(),
            queue: Arc::new(StreamQueue {
                items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a sample. Never waits; evicts the oldest sample when full.
    pub fn put(&self, value: impl Into<Value>) {
        {
            let mut items = self.queue.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() >= self.queue.capacity {
                items.pop_front();
                self.queue.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(value.into());
        }
        self.queue.notify.notify_one();
    }

    /// Samples evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Samples waiting to be sent.
    pub fn pending(&self) -> usize {
        self.queue
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn take(&self, min_batch: usize) -> Option<Vec<Value>> {
        let mut items = self.queue.items.lock().unwrap_or_else(|e| e.into_inner());
        if min_batch <= 1 {
            return items.pop_front().map(|item| vec![item]);
        }
        if items.len() >= min_batch {
            return Some(items.drain(..).collect());
        }
        None
    }
}

/// One unit handed to the transmitter by the drain task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// A single sample sent under the stream's own key.
    Single(Value),
    /// A `STREAM` wrapper value.
    Batch(Value),
}

/// Create a stream and start its drain task.
///
/// `transmit` is called from the drain task for every unit to send. A
/// `min_batch` above `capacity` is lowered to `capacity`, so a full queue
/// always flushes.
pub fn spawn_stream<F>(
    key: &str,
    subject: &str,
    min_batch: usize,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
    transmit: F,
) -> (StreamHandle, JoinHandle<()>)
where
    F: Fn(Outgoing) + Send + 'static,
{
    let handle = StreamHandle::new(key, capacity);
    let capacity = handle.queue.capacity;
    let min_batch = if min_batch > capacity {
        warn!(key = %key, min_batch, capacity, "Stream batch size exceeds queue capacity, clamping");
        capacity
    } else {
        min_batch
    };
    let drain = handle.clone();
    let subject = subject.to_string();
    let task = tokio::spawn(async move {
        loop {
            if let Some(batch) = drain.take(min_batch) {
                if min_batch <= 1 {
                    for item in batch {
                        transmit(Outgoing::Single(item));
                    }
                } else {
                    debug!(key = %drain.key, size = batch.len(), "Flushing stream batch");
                    transmit(Outgoing::Batch(wrap_batch(&drain.key, &subject, batch)));
                }
                continue;
            }
            tokio::select! {
                _ = drain.queue.notify.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
    });
    (handle, task)
}

/// Build the value of a `STREAM` message.
pub fn wrap_batch(key: &str, subject: &str, batch: Vec<Value>) -> Value {
    Value::map([
        (INNER_KEY, Value::from(key)),
        ("headers", Value::map([("subject", Value::from(subject))])),
        (PAYLOAD, Value::List(batch)),
    ])
}

/// Split a `STREAM` value into its inner key and items.
pub fn unwrap_batch(value: Value) -> Option<(String, Vec<Value>)> {
    let Value::Map(mut map) = value else {
        return None;
    };
    let key = match map.remove(INNER_KEY)? {
        Value::Str(key) if !key.is_empty() => key,
        _ => return None,
    };
    let items = match map.remove(PAYLOAD).unwrap_or_default() {
        Value::List(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    };
    Some((key, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_put_drops_oldest_when_full() {
        let handle = StreamHandle::new("IMU", 3);
        for i in 0..5 {
            handle.put(Value::Int(i));
        }
        assert_eq!(handle.pending(), 3);
        assert_eq!(handle.dropped(), 2);
        let batch = handle.take(3).unwrap();
        assert_eq!(batch, vec![Value::Int(2), Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn test_wrap_unwrap() {
        let value = wrap_batch("IMU", "rig-1", vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(value.get("headers").and_then(|h| h.get("subject")).and_then(Value::as_str), Some("rig-1"));
        let (key, items) = unwrap_batch(value).unwrap();
        assert_eq!(key, "IMU");
        assert_eq!(items.len(), 2);

        assert!(unwrap_batch(Value::from("nope")).is_none());
        assert!(unwrap_batch(Value::map([("payload", Value::Int(1))])).is_none());
    }

    #[tokio::test]
    async fn test_batches_reach_min_size() {
        let (_tx, rx) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_stream("IMU", "rig-1", 4, 64, rx, move |out| {
            let _ = out_tx.send(out);
        });

        for i in 0..3 {
            handle.put(Value::Int(i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out_rx.try_recv().is_err());

        handle.put(Value::Int(3));
        let out = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outgoing::Batch(value) = out else {
            panic!("expected a batch");
        };
        let (key, items) = unwrap_batch(value).unwrap();
        assert_eq!(key, "IMU");
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_min_batch_above_capacity_still_flushes() {
        let (_tx, rx) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_stream("IMU", "rig", 10, 4, rx, move |out| {
            let _ = out_tx.send(out);
        });
        for i in 0..4 {
            handle.put(Value::Int(i));
        }
        let out = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outgoing::Batch(value) = out else {
            panic!("expected a batch");
        };
        let (_, items) = unwrap_batch(value).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(handle.dropped(), 0);
    }

    #[tokio::test]
    async fn test_min_batch_one_sends_singles() {
        let (_tx, rx) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_stream("IMU", "rig-1", 1, 64, rx, move |out| {
            let _ = out_tx.send(out);
        });
        handle.put(Value::Int(5));
        handle.put(Value::Int(6));
        for expected in [5, 6] {
            let out = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(out, Outgoing::Single(Value::Int(expected)));
        }
    }
}
