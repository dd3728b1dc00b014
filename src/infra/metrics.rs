//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; `report()` swaps the periodic counters
//! to get a consistent snapshot while concurrent updates continue.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::io::carrier_client::CarrierErrorKind;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Carrier call latency bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
const BUCKET_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Scheduler ticks run (monotonic)
    ticks_total: AtomicU64,
    /// Reconciliations that completed (monotonic)
    reconciled_total: AtomicU64,
    /// Reconciliations that returned an error (monotonic)
    reconcile_failed_total: AtomicU64,
    /// Reconciliations since last report (reset on report)
    reconciled_since_report: AtomicU64,
    /// New events merged into aggregates (monotonic)
    events_merged_total: AtomicU64,
    /// Envelopes handed to the publisher (monotonic)
    events_published_total: AtomicU64,
    /// Envelopes the publisher refused (monotonic)
    publish_failures_total: AtomicU64,
    /// Codes created by registration (monotonic)
    codes_registered_total: AtomicU64,
    /// Codes brought back by registration (monotonic)
    codes_reactivated_total: AtomicU64,
    /// Events removed by retention (monotonic)
    events_pruned_total: AtomicU64,
    /// Carrier errors by kind, indexed by `CarrierErrorKind::index` (monotonic)
    carrier_errors: [AtomicU64; CarrierErrorKind::COUNT],
    /// Carrier calls that reached the transport (monotonic)
    carrier_calls_total: AtomicU64,
    /// Carrier latency histogram (monotonic, Prometheus cumulative)
    carrier_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of carrier latencies in ms (monotonic)
    carrier_latency_sum_ms: AtomicU64,
    /// Max carrier latency in ms (reset on report)
    carrier_latency_max_ms: AtomicU64,
    /// Reconciliations currently running
    in_flight: AtomicU64,
    /// Highest `in_flight` ever observed
    in_flight_max: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            reconciled_total: AtomicU64::new(0),
            reconcile_failed_total: AtomicU64::new(0),
            reconciled_since_report: AtomicU64::new(0),
            events_merged_total: AtomicU64::new(0),
            events_published_total: AtomicU64::new(0),
            publish_failures_total: AtomicU64::new(0),
            codes_registered_total: AtomicU64::new(0),
            codes_reactivated_total: AtomicU64::new(0),
            events_pruned_total: AtomicU64::new(0),
            carrier_errors: std::array::from_fn(|_| AtomicU64::new(0)),
            carrier_calls_total: AtomicU64::new(0),
            carrier_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            carrier_latency_sum_ms: AtomicU64::new(0),
            carrier_latency_max_ms: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            in_flight_max: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconciled(&self, events_merged: usize) {
        self.reconciled_total.fetch_add(1, Ordering::Relaxed);
        self.reconciled_since_report.fetch_add(1, Ordering::Relaxed);
        self.events_merged_total.fetch_add(events_merged as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconcile_failed(&self) {
        self.reconcile_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_published(&self) {
        self.events_published_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.publish_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registered(&self) {
        self.codes_registered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reactivated(&self) {
        self.codes_reactivated_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_pruned(&self, count: usize) {
        self.events_pruned_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_carrier_error(&self, kind: CarrierErrorKind) {
        self.carrier_errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record one carrier call that reached the transport
    #[inline]
    pub fn record_carrier_latency(&self, latency_ms: u64) {
        self.carrier_calls_total.fetch_add(1, Ordering::Relaxed);
        self.carrier_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.carrier_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.carrier_latency_max_ms, latency_ms);
    }

    /// Mark one reconciliation as running until the guard drops
    pub fn in_flight_guard(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        update_atomic_max(&self.in_flight_max, now);
        InFlightGuard { metrics: Arc::clone(self) }
    }

    pub fn carrier_errors(&self, kind: CarrierErrorKind) -> u64 {
        self.carrier_errors[kind.index()].load(Ordering::Relaxed)
    }

    pub fn circuit_rejections(&self) -> u64 {
        self.carrier_errors(CarrierErrorKind::CircuitOpen)
    }

    pub fn reconciled_total(&self) -> u64 {
        self.reconciled_total.load(Ordering::Relaxed)
    }

    pub fn reconcile_failed_total(&self) -> u64 {
        self.reconcile_failed_total.load(Ordering::Relaxed)
    }

    pub fn events_published_total(&self) -> u64 {
        self.events_published_total.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn in_flight_max(&self) -> u64 {
        self.in_flight_max.load(Ordering::Relaxed)
    }

    /// Summary for the periodic log line; resets the periodic counters
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Summary without resetting anything (used by the /metrics scrape)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let take = |counter: &AtomicU64| {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };

        let reconciled_since = take(&self.reconciled_since_report);
        let latency_max_ms = take(&self.carrier_latency_max_ms);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };
        let reconciled_per_min = if elapsed.as_secs_f64() > 0.0 {
            reconciled_since as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let latency_buckets = load_buckets(&self.carrier_latency_buckets);
        let carrier_calls_total = self.carrier_calls_total.load(Ordering::Relaxed);
        let latency_sum_ms = self.carrier_latency_sum_ms.load(Ordering::Relaxed);
        let latency_avg_ms =
            if carrier_calls_total > 0 { latency_sum_ms / carrier_calls_total } else { 0 };

        let mut carrier_errors = [0u64; CarrierErrorKind::COUNT];
        for (i, counter) in self.carrier_errors.iter().enumerate() {
            carrier_errors[i] = counter.load(Ordering::Relaxed);
        }

        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            reconciled_total: self.reconciled_total.load(Ordering::Relaxed),
            reconcile_failed_total: self.reconcile_failed_total.load(Ordering::Relaxed),
            reconciled_per_min,
            events_merged_total: self.events_merged_total.load(Ordering::Relaxed),
            events_published_total: self.events_published_total.load(Ordering::Relaxed),
            publish_failures_total: self.publish_failures_total.load(Ordering::Relaxed),
            codes_registered_total: self.codes_registered_total.load(Ordering::Relaxed),
            codes_reactivated_total: self.codes_reactivated_total.load(Ordering::Relaxed),
            events_pruned_total: self.events_pruned_total.load(Ordering::Relaxed),
            carrier_errors,
            carrier_calls_total,
            latency_buckets,
            latency_sum_ms,
            latency_avg_ms,
            latency_max_ms,
            latency_p50_ms: percentile_from_buckets(&latency_buckets, 0.50),
            latency_p99_ms: percentile_from_buckets(&latency_buckets, 0.99),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            in_flight_max: self.in_flight_max.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge on drop
pub struct InFlightGuard {
    metrics: Arc<Metrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub reconciled_total: u64,
    pub reconcile_failed_total: u64,
    /// Completed reconciliations per minute since the last report
    pub reconciled_per_min: f64,
    pub events_merged_total: u64,
    pub events_published_total: u64,
    pub publish_failures_total: u64,
    pub codes_registered_total: u64,
    pub codes_reactivated_total: u64,
    pub events_pruned_total: u64,
    /// Indexed by `CarrierErrorKind::index`
    pub carrier_errors: [u64; CarrierErrorKind::COUNT],
    pub carrier_calls_total: u64,
    /// Bounds: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800 ms
    pub latency_buckets: [u64; NUM_BUCKETS],
    pub latency_sum_ms: u64,
    pub latency_avg_ms: u64,
    /// Max since the last report
    pub latency_max_ms: u64,
    pub latency_p50_ms: u64,
    pub latency_p99_ms: u64,
    pub in_flight: u64,
    pub in_flight_max: u64,
}

impl MetricsSummary {
    pub fn carrier_errors_total(&self) -> u64 {
        self.carrier_errors.iter().sum()
    }

    pub fn log(&self) {
        info!(
            ticks = %self.ticks_total,
            reconciled = %self.reconciled_total,
            failed = %self.reconcile_failed_total,
            per_min = format!("{:.1}", self.reconciled_per_min),
            merged = %self.events_merged_total,
            published = %self.events_published_total,
            publish_failed = %self.publish_failures_total,
            carrier_errors = %self.carrier_errors_total(),
            circuit_rejected = %self.carrier_errors[CarrierErrorKind::CircuitOpen.index()],
            p50_ms = %self.latency_p50_ms,
            p99_ms = %self.latency_p99_ms,
            max_ms = %self.latency_max_ms,
            in_flight_max = %self.in_flight_max,
            "metrics"
        );
    }
}
