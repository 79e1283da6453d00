//! Dropped-message accounting and latency fanout.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::info;

use crate::net::verb::Verb;

/// Observer of reply latencies, fed by callbacks that opt in. The dynamic
/// snitch subscribes here to score peers.
pub trait LatencySubscriber: Send + Sync {
    /// Records one reply latency for `address`.
    fn receive_timing(&self, address: IpAddr, latency: Duration);
}

struct DroppedMessageMetrics {
    verb: Verb,
    dropped: AtomicU64,
    last_logged: AtomicU64,
}

/// Lifetime dropped counters per droppable verb, plus the snapshot used to
/// derive the "recent" delta each log tick.
pub struct DroppedMessages {
    metrics: Vec<DroppedMessageMetrics>,
}

impl Default for DroppedMessages {
    fn default() -> Self {
        Self::new()
    }
}

impl DroppedMessages {
    /// Counters for every droppable verb.
    #[must_use]
    pub fn new() -> Self {
        let metrics = Verb::ALL
            .into_iter()
            .filter(|verb| verb.is_droppable())
            .map(|verb| DroppedMessageMetrics {
                verb,
                dropped: AtomicU64::new(0),
                last_logged: AtomicU64::new(0),
            })
            .collect();
        Self { metrics }
    }

    /// Bumps the dropped counter for `verb`.
    pub fn increment(&self, verb: Verb) {
        assert!(
            verb.is_droppable(),
            "verb {verb:?} should not legally be dropped"
        );
        if let Some(metric) = self.metrics.iter().find(|metric| metric.verb == verb) {
            metric.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Lifetime dropped count for `verb`; zero for non-droppable verbs.
    #[must_use]
    pub fn count(&self, verb: Verb) -> u64 {
        self.metrics
            .iter()
            .find(|metric| metric.verb == verb)
            .map_or(0, |metric| metric.dropped.load(Ordering::Relaxed))
    }

    /// Lifetime dropped counts for the management surface.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Verb, u64)> {
        self.metrics
            .iter()
            .map(|metric| (metric.verb, metric.dropped.load(Ordering::Relaxed)))
            .collect()
    }

    /// Logs the delta since the previous tick for each verb that dropped
    /// anything, then advances the snapshot.
    pub fn log_recent(&self, interval: Duration) {
        for metric in &self.metrics {
            let dropped = metric.dropped.load(Ordering::Relaxed);
            let recent = dropped - metric.last_logged.load(Ordering::Relaxed);
            if recent > 0 {
                info!(
                    verb = ?metric.verb,
                    recent,
                    interval_ms = interval.as_millis() as u64,
                    "messages dropped in last interval"
                );
                metric.last_logged.store(dropped, Ordering::Relaxed);
            }
        }
    }

    /// Periodic delta logger, running until shutdown is signalled.
    pub async fn run_drop_logger(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick fires immediately and would log nothing anyway.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.log_recent(interval),
            }
        }
    }
}
