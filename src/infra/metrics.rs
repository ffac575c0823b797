//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Number of histogram buckets (exported for consumers)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

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

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

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

/// Lock-free metrics collector for the incident pipeline
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total frames ever processed (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Sum of frame processing latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max frame processing latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Frame processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Detections accepted into the aggregator (monotonic)
    detections_kept: AtomicU64,
    /// Detections discarded below the confidence floor (monotonic)
    detections_discarded: AtomicU64,
    /// Samples dropped to preserve window ordering (monotonic)
    samples_out_of_order: AtomicU64,
    /// Windows handed to the temporal classifier (monotonic)
    windows_scored: AtomicU64,
    /// Tracks that entered Suspected (monotonic)
    suspicions_raised: AtomicU64,
    /// Incidents freshly inserted (monotonic)
    incidents_confirmed: AtomicU64,
    /// Incident inserts reconciled to an existing dedup key (monotonic)
    incidents_deduped: AtomicU64,
    /// Schedule lookups answering Unknown (monotonic)
    validations_unknown: AtomicU64,
    /// Notification sends acknowledged (monotonic)
    notifications_sent: AtomicU64,
    /// Individual send failures, pre-exhaustion (monotonic)
    notifications_failed: AtomicU64,
    /// Channels that ran out of attempts (monotonic, operator alert)
    notifications_exhausted: AtomicU64,
    /// Tracks evicted as Lost (monotonic)
    tracks_lost: AtomicU64,
    /// Incident records anonymized by the retention job (monotonic)
    incidents_anonymized: AtomicU64,
    /// Per-track scoring failures isolated and reset (monotonic)
    track_errors: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            detections_kept: AtomicU64::new(0),
            detections_discarded: AtomicU64::new(0),
            samples_out_of_order: AtomicU64::new(0),
            windows_scored: AtomicU64::new(0),
            suspicions_raised: AtomicU64::new(0),
            incidents_confirmed: AtomicU64::new(0),
            incidents_deduped: AtomicU64::new(0),
            validations_unknown: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            notifications_exhausted: AtomicU64::new(0),
            tracks_lost: AtomicU64::new(0),
            incidents_anonymized: AtomicU64::new(0),
            track_errors: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one processed frame and its end-to-end latency (lock-free)
    #[inline]
    pub fn record_frame(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_detection(&self, kept: bool) {
        if kept {
            self.detections_kept.fetch_add(1, Ordering::Relaxed);
        } else {
            self.detections_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_out_of_order_sample(&self) {
        self.samples_out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_window_scored(&self) {
        self.windows_scored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_suspicion_raised(&self) {
        self.suspicions_raised.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_incident_confirmed(&self, deduped: bool) {
        if deduped {
            self.incidents_deduped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.incidents_confirmed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_validation_unknown(&self) {
        self.validations_unknown.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_exhausted(&self) {
        self.notifications_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_track_lost(&self) {
        self.tracks_lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_incident_anonymized(&self) {
        self.incidents_anonymized.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_track_error(&self) {
        self.track_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incidents_confirmed_total(&self) -> u64 {
        self.incidents_confirmed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn notifications_exhausted_total(&self) -> u64 {
        self.notifications_exhausted.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, active_tracks: usize) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if frames_count > 0 { latency_sum / frames_count } else { 0 };

        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec,
            avg_frame_latency_us: avg_latency,
            max_frame_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            active_tracks,
            detections_kept: self.detections_kept.load(Ordering::Relaxed),
            detections_discarded: self.detections_discarded.load(Ordering::Relaxed),
            samples_out_of_order: self.samples_out_of_order.load(Ordering::Relaxed),
            windows_scored: self.windows_scored.load(Ordering::Relaxed),
            suspicions_raised: self.suspicions_raised.load(Ordering::Relaxed),
            incidents_confirmed: self.incidents_confirmed.load(Ordering::Relaxed),
            incidents_deduped: self.incidents_deduped.load(Ordering::Relaxed),
            validations_unknown: self.validations_unknown.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_exhausted: self.notifications_exhausted.load(Ordering::Relaxed),
            tracks_lost: self.tracks_lost.load(Ordering::Relaxed),
            incidents_anonymized: self.incidents_anonymized.load(Ordering::Relaxed),
            track_errors: self.track_errors.load(Ordering::Relaxed),
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
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    /// Frame processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub active_tracks: usize,
    pub detections_kept: u64,
    pub detections_discarded: u64,
    pub samples_out_of_order: u64,
    pub windows_scored: u64,
    pub suspicions_raised: u64,
    pub incidents_confirmed: u64,
    pub incidents_deduped: u64,
    pub validations_unknown: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub notifications_exhausted: u64,
    pub tracks_lost: u64,
    pub incidents_anonymized: u64,
    pub track_errors: u64,
}

impl MetricsSummary {
    /// Log the summary as a structured event
    pub fn log(&self) {
        info!(
            frames_total = self.frames_total,
            frames_per_sec = self.frames_per_sec,
            avg_latency_us = self.avg_frame_latency_us,
            max_latency_us = self.max_frame_latency_us,
            p50_us = self.lat_p50_us,
            p95_us = self.lat_p95_us,
            p99_us = self.lat_p99_us,
            active_tracks = self.active_tracks,
            detections_kept = self.detections_kept,
            detections_discarded = self.detections_discarded,
            samples_out_of_order = self.samples_out_of_order,
            windows_scored = self.windows_scored,
            suspicions = self.suspicions_raised,
            incidents = self.incidents_confirmed,
            deduped = self.incidents_deduped,
            validations_unknown = self.validations_unknown,
            sent = self.notifications_sent,
            failed = self.notifications_failed,
            exhausted = self.notifications_exhausted,
            tracks_lost = self.tracks_lost,
            anonymized = self.incidents_anonymized,
            track_errors = self.track_errors,
            "metrics_report"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(100_000), 10);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_frame(500);
        metrics.record_frame(1500);

        let summary = metrics.report(3);
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.avg_frame_latency_us, 1000);
        assert_eq!(summary.max_frame_latency_us, 1500);
        assert_eq!(summary.active_tracks, 3);

        // Second report: periodic counters cleared, monotonic retained
        let summary = metrics.report(0);
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.avg_frame_latency_us, 0);
        assert_eq!(summary.max_frame_latency_us, 0);
    }

    #[test]
    fn test_monotonic_counters() {
        let metrics = Metrics::new();
        metrics.record_incident_confirmed(false);
        metrics.record_incident_confirmed(true);
        metrics.record_notification_exhausted();

        let summary = metrics.report(0);
        assert_eq!(summary.incidents_confirmed, 1);
        assert_eq!(summary.incidents_deduped, 1);
        assert_eq!(summary.notifications_exhausted, 1);
        assert_eq!(metrics.incidents_confirmed_total(), 1);
    }

    #[test]
    fn test_percentiles_from_histogram() {
        let metrics = Metrics::new();
        for _ in 0..99 {
            metrics.record_frame(90);
        }
        metrics.record_frame(40_000);

        let summary = metrics.report(0);
        assert_eq!(summary.lat_p50_us, 100);
        assert_eq!(summary.lat_p99_us, 100);
    }
}
