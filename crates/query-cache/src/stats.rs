//! Cache machine statistics tracking
//!
//! Counters are plain atomics so progress estimation can read them from any
//! thread without touching the cache lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for one cache machine
#[derive(Debug, Default)]
pub struct CacheStats {
    batches_added: AtomicU64,
    batches_pulled: AtomicU64,
    rows_added: AtomicU64,
    rows_pulled: AtomicU64,
    bytes_added: AtomicU64,
    /// Batches demoted from resident to host memory on insert
    demoted_to_host: AtomicU64,
    /// Batches written to spill files on insert
    spilled: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_add(&self, rows: usize, bytes: usize) {
        self.batches_added.fetch_add(1, Ordering::Relaxed);
        self.rows_added.fetch_add(rows as u64, Ordering::Relaxed);
        self.bytes_added.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_pull(&self, rows: usize) {
        self.batches_pulled.fetch_add(1, Ordering::Relaxed);
        self.rows_pulled.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demoted_to_host.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spill(&self) {
        self.spilled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches_added(&self) -> u64 {
        self.batches_added.load(Ordering::Relaxed)
    }

    pub fn batches_pulled(&self) -> u64 {
        self.batches_pulled.load(Ordering::Relaxed)
    }

    /// Rows pushed into the cache so far
    pub fn total_rows_added(&self) -> u64 {
        self.rows_added.load(Ordering::Relaxed)
    }

    pub fn total_rows_pulled(&self) -> u64 {
        self.rows_pulled.load(Ordering::Relaxed)
    }

    pub fn total_bytes_added(&self) -> u64 {
        self.bytes_added.load(Ordering::Relaxed)
    }

    pub fn demoted_to_host(&self) -> u64 {
        self.demoted_to_host.load(Ordering::Relaxed)
    }

    pub fn spilled(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    /// Entries currently queued (added but not yet pulled)
    pub fn pending(&self) -> u64 {
        self.batches_added().saturating_sub(self.batches_pulled())
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batches {}/{} rows {}/{} demoted {} spilled {}",
            self.batches_pulled(),
            self.batches_added(),
            self.total_rows_pulled(),
            self.total_rows_added(),
            self.demoted_to_host(),
            self.spilled()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_pull_accounting() {
        let stats = CacheStats::new();
        stats.record_add(100, 800);
        stats.record_add(50, 400);
        stats.record_pull(100);

        assert_eq!(stats.batches_added(), 2);
        assert_eq!(stats.total_rows_added(), 150);
        assert_eq!(stats.total_bytes_added(), 1200);
        assert_eq!(stats.total_rows_pulled(), 100);
        assert_eq!(stats.pending(), 1);
    }

    #[test]
    fn test_tier_counters() {
        let stats = CacheStats::new();
        stats.record_demotion();
        stats.record_spill();
        stats.record_spill();
        assert_eq!(stats.demoted_to_host(), 1);
        assert_eq!(stats.spilled(), 2);
    }
}
