//! Rate-limited fan-out for continuous data.
//!
//! One timer per relay arms a ready marker for every consumer at the
//! configured frequency. A sample goes to a consumer only if its marker is
//! armed, which disarms it; otherwise the sample is dropped for that
//! consumer. Nothing is queued, so a producer is never held back.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
pub struct ContinuousRelay {
    period: Duration,
    ready: DashMap<String, bool>,
}

impl ContinuousRelay {
    /// A relay firing `hz` times per second. Non-positive rates are treated
    /// as one per second.
    pub fn new(hz: f64) -> Self {
        let hz = if hz.is_finite() && hz > 0.0 { hz } else { 1.0 };
        Self {
            period: Duration::from_secs_f64(1.0 / hz),
            ready: DashMap::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start relaying to `consumer`. New consumers start armed.
    pub fn subscribe(&self, consumer: &str) {
        self.ready.entry(consumer.to_string()).or_insert(true);
    }

    pub fn consumers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ready.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Claim the consumer's slot for this period.
    pub fn try_take(&self, consumer: &str) -> bool {
        match self.ready.get_mut(consumer) {
            Some(mut ready) if *ready => {
                *ready = false;
                true
            }
            _ => false,
        }
    }

    /// Re-arm every consumer.
    pub fn arm_all(&self) {
        for mut ready in self.ready.iter_mut() {
            *ready = true;
        }
    }

    /// Arm every consumer once per period until `shutdown` fires.
    pub async fn run_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.arm_all(),
                _ = shutdown.changed() => break,
            }
        }
    }
}
