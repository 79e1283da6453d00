//! Pending-reply registry with per-entry expiry.
//!
//! Every request sent with a callback parks a [`CallbackInfo`] here keyed by
//! message id. The entry leaves the map exactly once: taken by the response
//! handler when the reply arrives, or evicted by the background sweeper once
//! its TTL passes, in which case the timeout reporter runs.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

use crate::error::NetError;
use crate::net::message::{MessageIn, PayloadCodec};

/// Continuation supplied by the sender of a request.
///
/// Exactly one of `response` or `on_failure` runs per request, never both.
/// `on_failure` only runs when the send opted in via the failure-callback
/// variant.
pub trait AsyncCallback: Send + Sync {
    /// Reply arrived before the timeout.
    fn response(&self, message: MessageIn);

    /// Request expired or the peer reported failure.
    fn on_failure(&self, _target: IpAddr) {}

    /// Whether reply latency should be fed to latency subscribers.
    fn is_latency_for_snitch(&self) -> bool {
        false
    }
}

/// Everything the fabric needs to route and decode one pending reply.
#[derive(Clone)]
pub struct CallbackInfo {
    /// Peer the request was sent to.
    pub target: IpAddr,
    /// Sender-supplied continuation.
    pub callback: Arc<dyn AsyncCallback>,
    /// Decoder for the reply body, chosen from the originating verb.
    pub response_serializer: Option<&'static dyn PayloadCodec>,
    /// Whether `on_failure` should run on expiry.
    pub failure_callback: bool,
}

/// Invoked once per expired entry with (id, entry, elapsed). Must not block;
/// blocking work is delegated to a stage.
pub type TimeoutReporter = Box<dyn Fn(u32, &CallbackInfo, Duration) + Send + Sync>;

struct ExpiringEntry {
    value: CallbackInfo,
    created: Instant,
    ttl: Duration,
}

impl ExpiringEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= self.ttl
    }
}

/// Map of message id to pending callback with per-entry TTL.
pub struct ExpiringMap {
    entries: Arc<DashMap<u32, ExpiringEntry>>,
    shutting_down: Arc<AtomicBool>,
    swept: Arc<Notify>,
    min_ttl_millis: Arc<AtomicU64>,
    sweeper: JoinHandle<()>,
}

impl ExpiringMap {
    /// Starts the registry and its background sweeper. The sweeper runs at
    /// half the smallest TTL seen so far, clamped to [10 ms, 1 s]. Must run
    /// inside a tokio runtime.
    #[must_use]
    pub fn new(default_ttl: Duration, reporter: TimeoutReporter) -> Self {
        let entries: Arc<DashMap<u32, ExpiringEntry>> = Arc::new(DashMap::new());
        let shutting_down = Arc::new(AtomicBool::new(false));
        let swept = Arc::new(Notify::new());
        let min_ttl_millis = Arc::new(AtomicU64::new(default_ttl.as_millis().max(1) as u64));

        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&entries),
            Arc::clone(&shutting_down),
            Arc::clone(&swept),
            Arc::clone(&min_ttl_millis),
            reporter,
        ));

        Self {
            entries,
            shutting_down,
            swept,
            min_ttl_millis,
            sweeper,
        }
    }

    /// Inserts a pending callback with the supplied TTL.
    ///
    /// Returns the previous entry for the id; a live previous entry is a
    /// caller bug. Rejected once shutdown has begun.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::ShuttingDown`] after `shutdown_blocking` started.
    pub fn put(
        &self,
        id: u32,
        value: CallbackInfo,
        ttl: Duration,
    ) -> Result<Option<CallbackInfo>, NetError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(NetError::ShuttingDown);
        }
        self.min_ttl_millis
            .fetch_min(ttl.as_millis().max(1) as u64, Ordering::Relaxed);
        let previous = self.entries.insert(
            id,
            ExpiringEntry {
                value,
                created: Instant::now(),
                ttl,
            },
        );
        Ok(previous.map(|entry| entry.value))
    }

    /// Peeks at a pending callback without removing it.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<CallbackInfo> {
        self.entries.get(&id).map(|entry| entry.value.clone())
    }

    /// Takes a pending callback. At most one caller wins; the sweeper uses
    /// the same removal primitive, so reply arrival and expiry cannot both
    /// observe the entry.
    #[must_use]
    pub fn remove(&self, id: u32) -> Option<CallbackInfo> {
        self.entries.remove(&id).map(|(_, entry)| entry.value)
    }

    /// Elapsed time since the entry was inserted, for latency accounting.
    #[must_use]
    pub fn get_age(&self, id: u32) -> Option<Duration> {
        self.entries.get(&id).map(|entry| entry.created.elapsed())
    }

    /// Number of pending callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no callbacks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all entries without invoking the timeout reporter. Test hook
    /// for stop/restart cycles.
    pub fn reset(&self) {
        self.entries.clear();
    }

    /// Stops accepting inserts and waits until every pending entry has been
    /// taken or has expired.
    pub async fn shutdown_blocking(&self) {
        self.shutting_down.store(true, Ordering::Release);
        while !self.entries.is_empty() {
            // The sweeper signals after each pass; the bound covers a signal
            // racing ahead of this waiter's registration.
            let _ = time::timeout(Duration::from_millis(20), self.swept.notified()).await;
        }
    }
}

impl Drop for ExpiringMap {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep_loop(
    entries: Arc<DashMap<u32, ExpiringEntry>>,
    shutting_down: Arc<AtomicBool>,
    swept: Arc<Notify>,
    min_ttl_millis: Arc<AtomicU64>,
    reporter: TimeoutReporter,
) {
    loop {
        let granularity = Duration::from_millis(min_ttl_millis.load(Ordering::Relaxed) / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        time::sleep(granularity).await;

        let now = Instant::now();
        let expired: Vec<u32> = entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        for id in expired {
            // remove_if arbitrates against concurrent reply arrival; only
            // the winner reports the timeout.
            if let Some((_, entry)) = entries.remove_if(&id, |_, entry| entry.is_expired(now)) {
                trace!(id, "callback expired");
                reporter(id, &entry.value, entry.created.elapsed());
            }
        }

        if shutting_down.load(Ordering::Acquire) {
            swept.notify_waiters();
            if entries.is_empty() {
                break;
            }
        }
    }
}
