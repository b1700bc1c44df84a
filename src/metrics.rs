//! Metrics Collection
//!
//! Process-wide counters for monitoring the seeder. Surfaced through the
//! periodic status log line; there is no external metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for the seeder
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Instant,

    /// DNS queries served (all types)
    pub dns_queries: AtomicU64,

    /// Handshake attempts started
    pub crawl_attempts: AtomicU64,

    /// Handshakes that produced a version message
    pub crawl_successes: AtomicU64,

    /// Handshakes that failed or timed out
    pub crawl_failures: AtomicU64,

    /// Genuinely new addresses inserted into the table
    pub addresses_added: AtomicU64,

    /// Inserts silently dropped because the table was full
    pub store_full_drops: AtomicU64,

    /// Snapshots written to disk
    pub snapshots_written: AtomicU64,

    /// Snapshot writes that failed
    pub snapshot_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            dns_queries: AtomicU64::new(0),
            crawl_attempts: AtomicU64::new(0),
            crawl_successes: AtomicU64::new(0),
            crawl_failures: AtomicU64::new(0),
            addresses_added: AtomicU64::new(0),
            store_full_drops: AtomicU64::new(0),
            snapshots_written: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn inc_dns_queries(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crawl_attempts(&self) {
        self.crawl_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crawl_successes(&self) {
        self.crawl_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crawl_failures(&self) {
        self.crawl_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_addresses_added(&self, count: u64) {
        self.addresses_added.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_store_full_drops(&self) {
        self.store_full_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_snapshots_written(&self) {
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_snapshot_failures(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
