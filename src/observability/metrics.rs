//! Replication counters
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Relaxed atomics; values are exact once writers are quiescent

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters shared by the coordinator, logger and recovery.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Writes applied on both copies
    writes_replicated: AtomicU64,
    /// Writes accepted on one copy and queued for the other
    writes_pending: AtomicU64,
    /// Writes rejected because no target was reachable
    writes_unreachable: AtomicU64,
    /// Log entries stored on the target because the source was unreachable
    log_entries_fallback: AtomicU64,
    /// Log entries that could not be stored on any node
    log_entries_dropped: AtomicU64,
    /// Reads answered by a fragment because Central was unreachable
    read_fallbacks: AtomicU64,
    /// Failed connection attempts
    connect_failures: AtomicU64,
    /// Queued replications applied by recovery
    recovery_replayed: AtomicU64,
    /// Queued replications given up after exhausting retries
    recovery_failed: AtomicU64,
    /// Recovery passes run
    recovery_runs: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Writes

    pub fn increment_replicated(&self) {
        self.writes_replicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pending(&self) {
        self.writes_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unreachable(&self) {
        self.writes_unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_log_fallback(&self) {
        self.log_entries_fallback.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_log_dropped(&self) {
        self.log_entries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Reads and connections

    pub fn increment_read_fallbacks(&self) {
        self.read_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Recovery

    pub fn add_recovery_replayed(&self, count: u64) {
        self.recovery_replayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_recovery_failed(&self, count: u64) {
        self.recovery_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_recovery_runs(&self) {
        self.recovery_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes_replicated: self.writes_replicated.load(Ordering::Relaxed),
            writes_pending: self.writes_pending.load(Ordering::Relaxed),
            writes_unreachable: self.writes_unreachable.load(Ordering::Relaxed),
            log_entries_fallback: self.log_entries_fallback.load(Ordering::Relaxed),
            log_entries_dropped: self.log_entries_dropped.load(Ordering::Relaxed),
            read_fallbacks: self.read_fallbacks.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            recovery_replayed: self.recovery_replayed.load(Ordering::Relaxed),
            recovery_failed: self.recovery_failed.load(Ordering::Relaxed),
            recovery_runs: self.recovery_runs.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub writes_replicated: u64,
    pub writes_pending: u64,
    pub writes_unreachable: u64,
    pub log_entries_fallback: u64,
    pub log_entries_dropped: u64,
    pub read_fallbacks: u64,
    pub connect_failures: u64,
    pub recovery_replayed: u64,
    pub recovery_failed: u64,
    pub recovery_runs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_registry_zeroed() {
        assert_eq!(MetricsRegistry::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.increment_replicated();
        metrics.increment_replicated();
        metrics.increment_pending();
        metrics.add_recovery_replayed(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.writes_replicated, 2);
        assert_eq!(snap.writes_pending, 1);
        assert_eq!(snap.recovery_replayed, 3);
        assert_eq!(snap.recovery_failed, 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.increment_read_fallbacks();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().read_fallbacks, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsRegistry::new().snapshot()).unwrap();
        assert_eq!(json["writes_pending"], 0);
    }
}
