//! End-of-run speculation counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the engine while it runs.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    spawned: AtomicU64,
    committed: AtomicU64,
    validation_aborts: AtomicU64,
    forced_aborts: AtomicU64,
    user_errors: AtomicU64,
    inline_admissions: AtomicU64,
    queue_rejections: AtomicU64,
    steals: AtomicU64,
    early_commits: AtomicU64,
    retries: AtomicU64,
    watchdog_demotions: AtomicU64,
    drained: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeculationStats {
    /// Tasks handed to the worker pool
    pub spawned: u64,
    /// Speculative transactions that validated and were published
    pub committed: u64,
    pub validation_aborts: u64,
    pub forced_aborts: u64,
    /// Committed outcomes that carried an error
    pub user_errors: u64,
    /// Forks executed inline instead of speculatively
    pub inline_admissions: u64,
    pub queue_rejections: u64,
    /// Queued tasks taken over by their consumer before any worker picked them up
    pub steals: u64,
    pub early_commits: u64,
    /// Computations re-executed at their settle point after an abort
    pub retries: u64,
    pub watchdog_demotions: u64,
    /// Tasks removed from the backlog by the watchdog
    pub drained: u64,
}

impl EngineMetrics {
    pub fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, user_error: bool) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        if user_error {
            self.user_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_user_error(&self) {
        self.user_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_abort(&self) {
        self.validation_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_aborts(&self, count: u64) {
        self.forced_aborts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_inline(&self) {
        self.inline_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
        self.inline_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_commit(&self) {
        self.early_commits.fetch_add(1, Ordering::Relaxed);
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self, drained: u64) {
        self.watchdog_demotions.fetch_add(1, Ordering::Relaxed);
        self.drained.fetch_add(drained, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SpeculationStats {
        SpeculationStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            validation_aborts: self.validation_aborts.load(Ordering::Relaxed),
            forced_aborts: self.forced_aborts.load(Ordering::Relaxed),
            user_errors: self.user_errors.load(Ordering::Relaxed),
            inline_admissions: self.inline_admissions.load(Ordering::Relaxed),
            queue_rejections: self.queue_rejections.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            early_commits: self.early_commits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            watchdog_demotions: self.watchdog_demotions.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = EngineMetrics::default();
        metrics.record_commit(false);
        metrics.record_commit(true);
        metrics.record_early_commit();
        metrics.record_rejection();
        metrics.record_forced_aborts(3);

        let stats = metrics.snapshot();
        assert_eq!(stats.committed, 3);
        assert_eq!(stats.user_errors, 1);
        assert_eq!(stats.early_commits, 1);
        assert_eq!(stats.queue_rejections, 1);
        assert_eq!(stats.inline_admissions, 1);
        assert_eq!(stats.forced_aborts, 3);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["committed"], 3);
    }
}
