//! Engine metrics
//!
//! Counters for submissions, attempts, nonce and gas events, polling and
//! reconciliation, plus a confirmation-latency histogram.
//!
//! ```rust,ignore
//! let metrics = EngineMetrics::new();
//! metrics.submitted();
//! let snapshot = metrics.snapshot().await;
//! println!("confirmed: {}", snapshot.confirmed);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Counter metrics (monotonically increasing)
#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected_in_flight: AtomicU64,
    confirmed: AtomicU64,
    reverted: AtomicU64,
    failed: AtomicU64,
    orphaned: AtomicU64,
    cancelled: AtomicU64,

    attempts: AtomicU64,
    retries: AtomicU64,
    nonce_resyncs: AtomicU64,
    gas_escalations: AtomicU64,

    events_observed: AtomicU64,
    poll_errors: AtomicU64,
    poller_restarts: AtomicU64,

    reconciled: AtomicU64,
    reconciled_orphans: AtomicU64,
    duplicate_events: AtomicU64,
    orphans_resolved: AtomicU64,
}

#[derive(Clone)]
struct HistogramBuckets {
    /// Upper limits, seconds
    boundaries: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramBuckets {
    fn new(boundaries: Vec<f64>) -> Self {
        let num_buckets = boundaries.len() + 1;
        Self {
            boundaries,
            counts: vec![0; num_buckets],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        let bucket = self
            .boundaries
            .iter()
            .position(|boundary| value <= *boundary)
            .unwrap_or(self.boundaries.len());
        self.counts[bucket] += 1;
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = (self.count as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self
                    .boundaries
                    .get(i)
                    .or_else(|| self.boundaries.last())
                    .copied()
                    .unwrap_or(0.0);
            }
        }
        self.boundaries.last().copied().unwrap_or(0.0)
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time view of the metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected_in_flight: u64,
    pub confirmed: u64,
    pub reverted: u64,
    pub failed: u64,
    pub orphaned: u64,
    pub cancelled: u64,
    pub attempts: u64,
    pub retries: u64,
    pub nonce_resyncs: u64,
    pub gas_escalations: u64,
    pub events_observed: u64,
    pub poll_errors: u64,
    pub poller_restarts: u64,
    pub reconciled: u64,
    pub reconciled_orphans: u64,
    pub duplicate_events: u64,
    pub orphans_resolved: u64,
    pub confirmation_p50_secs: f64,
    pub confirmation_p95_secs: f64,
    pub confirmation_mean_secs: f64,
    pub uptime_secs: u64,
}

/// Engine metrics collector
pub struct EngineMetrics {
    counters: Counters,
    confirmation_time: RwLock<HistogramBuckets>,
    start_time: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($($(#[$doc:meta])* $name:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self) {
                self.counters.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            confirmation_time: RwLock::new(HistogramBuckets::new(vec![
                5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
            ])),
            start_time: Instant::now(),
        }
    }

    counter! {
        /// Operation accepted for submission
        submitted => submitted;
        /// Submission refused by the single-flight check
        rejected_in_flight => rejected_in_flight;
        reverted => reverted;
        failed => failed;
        orphaned => orphaned;
        cancelled => cancelled;
        /// One broadcast attempt started
        attempt => attempts;
        /// Backoff sleep before another attempt
        retry => retries;
        nonce_resync => nonce_resyncs;
        gas_escalation => gas_escalations;
        event_observed => events_observed;
        poll_error => poll_errors;
        poller_restarted => poller_restarts;
        reconciled => reconciled;
        reconciled_orphan => reconciled_orphans;
        duplicate_event => duplicate_events;
        orphan_resolved => orphans_resolved;
    }

    /// Record a confirmation and how long it took from submission
    pub async fn confirmed(&self, latency: Duration) {
        self.counters.confirmed.fetch_add(1, Ordering::Relaxed);
        self.confirmation_time
            .write()
            .await
            .observe(latency.as_secs_f64());
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let histogram = self.confirmation_time.read().await;
        MetricsSnapshot {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected_in_flight: c.rejected_in_flight.load(Ordering::Relaxed),
            confirmed: c.confirmed.load(Ordering::Relaxed),
            reverted: c.reverted.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            orphaned: c.orphaned.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            nonce_resyncs: c.nonce_resyncs.load(Ordering::Relaxed),
            gas_escalations: c.gas_escalations.load(Ordering::Relaxed),
            events_observed: c.events_observed.load(Ordering::Relaxed),
            poll_errors: c.poll_errors.load(Ordering::Relaxed),
            poller_restarts: c.poller_restarts.load(Ordering::Relaxed),
            reconciled: c.reconciled.load(Ordering::Relaxed),
            reconciled_orphans: c.reconciled_orphans.load(Ordering::Relaxed),
            duplicate_events: c.duplicate_events.load(Ordering::Relaxed),
            orphans_resolved: c.orphans_resolved.load(Ordering::Relaxed),
            confirmation_p50_secs: histogram.percentile(50.0),
            confirmation_p95_secs: histogram.percentile(95.0),
            confirmation_mean_secs: histogram.mean(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}
