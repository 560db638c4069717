//! Listen tables and the handler worker pool.
//!
//! Handlers never run on an endpoint's I/O loop. Each dispatch becomes a
//! blocking job admitted through a semaphore, so a slow handler holds a
//! worker rather than stalling reception or the retry scan.

use fieldmesh_types::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

/// Callback for one message key. Receives only the decoded value.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, value: Value);
}

impl<F> Handler for F
where
    F: Fn(Value) + Send + Sync + 'static,
{
    fn handle(&self, value: Value) {
        self(value)
    }
}

/// Key → handler table registered when a node starts.
#[derive(Clone, Default)]
pub struct Listens {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Listens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `key`, replacing any earlier one.
    pub fn on(mut self, key: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.insert(key.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for Listens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listens").field("keys", &self.keys()).finish()
    }
}

/// Bounded pool running handler jobs off the I/O loop.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Queue `job`. It starts once a worker is free and always runs to
    /// completion; a panic is logged and does not affect the endpoint.
    pub fn run<F>(&self, key: &str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let key = key.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                error!(key = %key, error = %e, "Handler panicked");
            }
        });
    }
}
