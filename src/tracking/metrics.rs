use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide tracking counters, shared by every user's job.
#[derive(Debug)]
pub struct TrackerMetrics {
    ticks_completed: AtomicU64,
    ticks_failed: AtomicU64,
    listings_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    auth_failures: AtomicU64,
    start_time: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_completed: u64,
    pub ticks_failed: u64,
    pub listings_delivered: u64,
    pub delivery_failures: u64,
    pub auth_failures: u64,
    pub uptime_secs: u64,
    pub delivery_failure_rate: f64,
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self {
            ticks_completed: AtomicU64::new(0),
            ticks_failed: AtomicU64::new(0),
            listings_delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_ticks_completed(&self) {
        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_ticks_failed(&self) {
        self.ticks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_listings_delivered(&self, count: usize) {
        self.listings_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_delivery_failures(&self, count: usize) {
        self.delivery_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn increment_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::Relaxed)
    }

    pub fn get_ticks_failed(&self) -> u64 {
        self.ticks_failed.load(Ordering::Relaxed)
    }

    pub fn get_listings_delivered(&self) -> u64 {
        self.listings_delivered.load(Ordering::Relaxed)
    }

    pub fn get_delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn get_auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn get_uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Share of delivery attempts that failed.
    pub fn get_delivery_failure_rate(&self) -> f64 {
        let failed = self.get_delivery_failures();
        let attempted = self.get_listings_delivered() + failed;
        if attempted == 0 {
            0.0
        } else {
            failed as f64 / attempted as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_completed: self.get_ticks_completed(),
            ticks_failed: self.get_ticks_failed(),
            listings_delivered: self.get_listings_delivered(),
            delivery_failures: self.get_delivery_failures(),
            auth_failures: self.get_auth_failures(),
            uptime_secs: self.get_uptime_secs(),
            delivery_failure_rate: self.get_delivery_failure_rate(),
        }
    }

    pub fn log_report(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            "📊 Tracking stats: {} ticks ok, {} failed, {} listings delivered, {} delivery failures ({:.2}%), {} auth failures, up {}s",
            snapshot.ticks_completed,
            snapshot.ticks_failed,
            snapshot.listings_delivered,
            snapshot.delivery_failures,
            snapshot.delivery_failure_rate * 100.0,
            snapshot.auth_failures,
            snapshot.uptime_secs,
        );
    }
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
