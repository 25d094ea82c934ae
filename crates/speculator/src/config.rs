//! Engine and analysis configuration.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::{num::NonZeroUsize, thread, time::Duration};

/// How candidate tasks wait for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueStrategy {
    /// A task is accepted only if a worker is idle right now. Caps
    /// speculation depth at the worker count and cannot stall.
    SynchronousHandoff,
    /// Up to `capacity` tasks may wait for a worker. More parallelism,
    /// but relies on the watchdog to break stalls.
    BoundedQueue { capacity: usize },
}

/// Speculation engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit worker count. When unset, the pool is sized from the
    /// available hardware parallelism times `worker_multiplier`.
    pub workers: Option<usize>,
    pub worker_multiplier: f64,
    pub queue: QueueStrategy,
    /// Watchdog polling period in milliseconds.
    pub watchdog_interval_ms: u64,
    /// Consecutive stalled polls before the watchdog intervenes.
    pub stall_polls: u32,
    /// Read-set size at which a speculative task attempts a voluntary commit.
    pub max_read_set: usize,
    /// Maximum number of speculative ancestors a spawning task may have.
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            worker_multiplier: 1.0,
            queue: QueueStrategy::SynchronousHandoff,
            watchdog_interval_ms: 50,
            stall_polls: 4,
            max_read_set: 4096,
            max_depth: 16,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..self
        }
    }

    pub fn with_worker_multiplier(self, worker_multiplier: f64) -> Self {
        Self {
            worker_multiplier,
            ..self
        }
    }

    pub fn with_queue(self, queue: QueueStrategy) -> Self {
        Self { queue, ..self }
    }

    pub fn with_watchdog_interval(self, interval: Duration) -> Self {
        Self {
            watchdog_interval_ms: interval.as_millis() as u64,
            ..self
        }
    }

    pub fn with_stall_polls(self, stall_polls: u32) -> Self {
        Self {
            stall_polls,
            ..self
        }
    }

    pub fn with_max_read_set(self, max_read_set: usize) -> Self {
        Self {
            max_read_set,
            ..self
        }
    }

    pub fn with_max_depth(self, max_depth: usize) -> Self {
        Self { max_depth, ..self }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Number of pool workers this configuration yields (never zero).
    pub fn worker_count(&self) -> usize {
        if let Some(workers) = self.workers {
            return workers.max(1);
        }
        let parallelism = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        ((parallelism as f64 * self.worker_multiplier).round() as usize).max(1)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.workers == Some(0) {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if !(self.worker_multiplier.is_finite() && self.worker_multiplier > 0.0) {
            return Err(EngineError::Config(format!(
                "worker_multiplier must be positive, got {}",
                self.worker_multiplier
            )));
        }
        if let QueueStrategy::BoundedQueue { capacity: 0 } = self.queue {
            return Err(EngineError::Config(
                "bounded queue capacity must be at least 1".into(),
            ));
        }
        if self.watchdog_interval_ms == 0 || self.stall_polls == 0 {
            return Err(EngineError::Config(
                "watchdog interval and stall polls must be non-zero".into(),
            ));
        }
        if self.max_depth == 0 || self.max_read_set == 0 {
            return Err(EngineError::Config(
                "max_depth and max_read_set must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Overspeculation controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Work units between a spawn and its consumer needed to accept the fork.
    pub min_work: u32,
    /// Fixpoint iterations before the method reverts to sequential execution.
    pub max_iterations: u32,
    /// Allowed ratio of rewritten to original code size.
    pub max_growth: f64,
    /// Code size of the inline call sequence that replaces a rejected fork.
    pub rewrite_size: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_work: 10,
            max_iterations: 8,
            max_growth: 2.0,
            rewrite_size: 3,
        }
    }
}

impl AnalysisConfig {
    pub fn with_min_work(self, min_work: u32) -> Self {
        Self { min_work, ..self }
    }

    pub fn with_max_iterations(self, max_iterations: u32) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    pub fn with_max_growth(self, max_growth: f64) -> Self {
        Self { max_growth, ..self }
    }

    pub fn with_rewrite_size(self, rewrite_size: u32) -> Self {
        Self {
            rewrite_size,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(
            r#"{"workers": 3, "queue": {"kind": "bounded_queue", "capacity": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.queue, QueueStrategy::BoundedQueue { capacity: 8 });
        assert_eq!(config.stall_polls, EngineConfig::default().stall_polls);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            EngineConfig::default().with_workers(0).validate(),
            Err(EngineError::Config(_))
        ));
        assert!(
            EngineConfig::default()
                .with_queue(QueueStrategy::BoundedQueue { capacity: 0 })
                .validate()
                .is_err()
        );
        assert!(EngineConfig::default().with_worker_multiplier(0.0).validate().is_err());
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(EngineError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_analysis_config_from_json() {
        let config: AnalysisConfig = serde_json::from_str(r#"{"min_work": 25}"#).unwrap();
        assert_eq!(config.min_work, 25);
        assert_eq!(config.rewrite_size, AnalysisConfig::default().rewrite_size);
    }

    #[test]
    fn test_worker_multiplier_scales_pool() {
        let single = EngineConfig::default().worker_count();
        let doubled = EngineConfig::default()
            .with_worker_multiplier(2.0)
            .worker_count();
        assert!(doubled >= single);
    }
}
