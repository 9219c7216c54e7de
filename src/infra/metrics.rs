//! Lock-free metrics collection and periodic reporting
//!
//! Counters are updated from the poll loop and the API without locking.
//!
//! All atomics use Relaxed ordering: they are statistics only and must not
//! drive control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Sensor read latency bucket boundaries (milliseconds)
/// Buckets: ≤1, ≤2, ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, >1000
pub const READ_BUCKET_BOUNDS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];
pub const READ_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a read latency using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    READ_BUCKET_BOUNDS_MS.partition_point(|&bound| bound < latency_ms)
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

/// Lock-free metrics collector
pub struct Metrics {
    /// Lines returned by the transport (monotonic)
    frames_total: AtomicU64,
    /// Lines that did not parse to a detection (monotonic)
    frames_rejected: AtomicU64,
    /// Detections fed to the tracker (monotonic)
    detections_total: AtomicU64,
    /// Presence events persisted (monotonic)
    events_appended: AtomicU64,
    /// Presence events dropped after exhausting append retries (monotonic)
    store_failures: AtomicU64,
    /// Failed transport open attempts (monotonic)
    connect_failures: AtomicU64,
    /// Successful transport opens (monotonic)
    connects_total: AtomicU64,
    /// Reads that overran the read deadline (monotonic)
    read_deadline_overruns: AtomicU64,
    /// Poll cycles that ended in error backoff (monotonic)
    loop_errors: AtomicU64,
    /// Poll cycles completed (monotonic)
    poll_cycles: AtomicU64,
    /// Read latency histogram
    read_latency_buckets: [AtomicU64; READ_NUM_BUCKETS],
    /// Sum of read latencies in milliseconds
    read_latency_sum_ms: AtomicU64,
    /// Max read latency in milliseconds
    read_latency_max_ms: AtomicU64,
    /// Process start, for uptime and rate reporting
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connects_total: AtomicU64::new(0),
            read_deadline_overruns: AtomicU64::new(0),
            loop_errors: AtomicU64::new(0),
            poll_cycles: AtomicU64::new(0),
            read_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            read_latency_sum_ms: AtomicU64::new(0),
            read_latency_max_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a line read from the sensor and whether it parsed
    #[inline]
    pub fn record_frame(&self, parsed: bool) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        if parsed {
            self.detections_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_read_latency(&self, latency_ms: u64) {
        self.read_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.read_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.read_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_event_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect(&self, ok: bool) {
        if ok {
            self.connects_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connect_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_read_deadline_overrun(&self) {
        self.read_deadline_overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_loop_error(&self) {
        self.loop_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_poll_cycle(&self) {
        self.poll_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough copy of all counters for reporting
    pub fn report(&self) -> MetricsSummary {
        let mut read_buckets = [0u64; READ_NUM_BUCKETS];
        for (i, bucket) in self.read_latency_buckets.iter().enumerate() {
            read_buckets[i] = bucket.load(Ordering::Relaxed);
        }

        let uptime_secs = self.started_at.elapsed().as_secs_f64();
        let poll_cycles = self.poll_cycles.load(Ordering::Relaxed);
        let cycles_per_sec = if uptime_secs > 0.0 { poll_cycles as f64 / uptime_secs } else { 0.0 };

        MetricsSummary {
            uptime_secs,
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            events_appended: self.events_appended.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            connects_total: self.connects_total.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            read_deadline_overruns: self.read_deadline_overruns.load(Ordering::Relaxed),
            loop_errors: self.loop_errors.load(Ordering::Relaxed),
            poll_cycles,
            cycles_per_sec,
            read_buckets,
            read_latency_sum_ms: self.read_latency_sum_ms.load(Ordering::Relaxed),
            read_latency_max_ms: self.read_latency_max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the metrics counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime_secs: f64,
    pub frames_total: u64,
    pub frames_rejected: u64,
    pub detections_total: u64,
    pub events_appended: u64,
    pub store_failures: u64,
    pub connects_total: u64,
    pub connect_failures: u64,
    pub read_deadline_overruns: u64,
    pub loop_errors: u64,
    pub poll_cycles: u64,
    pub cycles_per_sec: f64,
    pub read_buckets: [u64; READ_NUM_BUCKETS],
    pub read_latency_sum_ms: u64,
    pub read_latency_max_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames = %self.frames_total,
            rejected = %self.frames_rejected,
            detections = %self.detections_total,
            events = %self.events_appended,
            store_failures = %self.store_failures,
            connect_failures = %self.connect_failures,
            read_overruns = %self.read_deadline_overruns,
            loop_errors = %self.loop_errors,
            cycles_per_sec = format!("{:.1}", self.cycles_per_sec),
            read_max_ms = %self.read_latency_max_ms,
            "metrics"
        );
    }
}
