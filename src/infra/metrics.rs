//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not drive any tracking decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// Monotonic counters are never reset. The delivery latency histogram
/// (feed receipt to sink callback) is swapped to zero on every `report()`.
pub struct Metrics {
    sessions_started: AtomicU64,
    sessions_stopped: AtomicU64,
    resolution_failures: AtomicU64,
    locations_received: AtomicU64,
    locations_delivered: AtomicU64,
    /// Dropped by the throttle window
    locations_throttled: AtomicU64,
    /// Dropped as near-duplicates of the last delivered position
    locations_stale: AtomicU64,
    /// Undecodable or out-of-range samples
    locations_invalid: AtomicU64,
    statuses_delivered: AtomicU64,
    statuses_duplicate: AtomicU64,
    store_errors: AtomicU64,
    geofence_notifications: AtomicU64,
    dispatch_failures: AtomicU64,
    deliveries_since_report: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_stopped: AtomicU64::new(0),
            resolution_failures: AtomicU64::new(0),
            locations_received: AtomicU64::new(0),
            locations_delivered: AtomicU64::new(0),
            locations_throttled: AtomicU64::new(0),
            locations_stale: AtomicU64::new(0),
            locations_invalid: AtomicU64::new(0),
            statuses_delivered: AtomicU64::new(0),
            statuses_duplicate: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            geofence_notifications: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            deliveries_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resolution_failure(&self) {
        self.resolution_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_received(&self) {
        self.locations_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered location with its processing latency
    #[inline]
    pub fn record_location_delivered(&self, latency_us: u64) {
        self.locations_delivered.fetch_add(1, Ordering::Relaxed);
        self.deliveries_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_location_throttled(&self) {
        self.locations_throttled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_stale(&self) {
        self.locations_stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_location_invalid(&self) {
        self.locations_invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_status(&self, delivered: bool) {
        if delivered {
            self.statuses_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.statuses_duplicate.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geofence_notification(&self) {
        self.geofence_notifications.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn locations_delivered(&self) -> u64 {
        self.locations_delivered.load(Ordering::Relaxed)
    }

    pub fn locations_throttled(&self) -> u64 {
        self.locations_throttled.load(Ordering::Relaxed)
    }

    pub fn statuses_delivered(&self) -> u64 {
        self.statuses_delivered.load(Ordering::Relaxed)
    }

    pub fn geofence_notifications(&self) -> u64 {
        self.geofence_notifications.load(Ordering::Relaxed)
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    /// Report metrics and reset periodic counters
    ///
    /// Uses atomic swap for the periodic window so concurrent updates are
    /// never lost, only attributed to the next window.
    pub fn report(&self, active_sessions: usize) -> MetricsSummary {
        let deliveries = self.deliveries_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let deliveries_per_sec = if elapsed.as_secs_f64() > 0.0 {
            deliveries as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if deliveries > 0 { latency_sum / deliveries } else { 0 };

        MetricsSummary {
            active_sessions,
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            locations_received: self.locations_received.load(Ordering::Relaxed),
            locations_delivered: self.locations_delivered.load(Ordering::Relaxed),
            locations_throttled: self.locations_throttled.load(Ordering::Relaxed),
            locations_stale: self.locations_stale.load(Ordering::Relaxed),
            locations_invalid: self.locations_invalid.load(Ordering::Relaxed),
            statuses_delivered: self.statuses_delivered.load(Ordering::Relaxed),
            statuses_duplicate: self.statuses_duplicate.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            geofence_notifications: self.geofence_notifications.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            deliveries_per_sec,
            avg_latency_us: avg_latency,
            max_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub active_sessions: usize,
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub resolution_failures: u64,
    pub locations_received: u64,
    pub locations_delivered: u64,
    pub locations_throttled: u64,
    pub locations_stale: u64,
    pub locations_invalid: u64,
    pub statuses_delivered: u64,
    pub statuses_duplicate: u64,
    pub store_errors: u64,
    pub geofence_notifications: u64,
    pub dispatch_failures: u64,
    pub deliveries_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Delivery latency histogram
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            active_sessions = %self.active_sessions,
            received = %self.locations_received,
            delivered = %self.locations_delivered,
            throttled = %self.locations_throttled,
            stale = %self.locations_stale,
            invalid = %self.locations_invalid,
            statuses = %self.statuses_delivered,
            store_errors = %self.store_errors,
            geofence = %self.geofence_notifications,
            deliveries_per_sec = format!("{:.2}", self.deliveries_per_sec),
            p50_us = %self.lat_p50_us,
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }
}
