//! Configuration structs enumerated per component (§6).
//!
//! These are plain structs with `Default` impls, constructed directly by
//! callers — no config-file parser lives in this crate. Loading configuration
//! from files/env/CLI is explicitly out of scope; typed structs are passed
//! straight into constructors instead.

use std::time::Duration;

/// Lease lifecycle configuration (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub lease_ms: i64,
    pub renew_interval_ms: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        // Default lease of 60s, with renewal at roughly a third of the
        // lease per §4.3.
        let lease_ms = 60_000;
        Self {
            lease_ms,
            renew_interval_ms: lease_ms / 3,
        }
    }
}

impl LeaseConfig {
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms.max(0) as u64)
    }
}

/// Retry/backoff configuration (§4.2, §7).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub initial_delay_ms: i64,
    pub multiplier: f64,
    pub max_delay_ms: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10 * 60_000,
        }
    }
}

/// Configuration for the worker-loop-level retry policy applied to repeated
/// transient store errors (§7 "workerLoopRetryConfig"), distinct from the
/// per-attempt `RetryConfig`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLoopRetryConfig {
    pub initial_delay_ms: i64,
    pub multiplier: f64,
    pub max_delay_ms: i64,
}

impl Default for WorkerLoopRetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Executor/worker loop configuration (§4.4).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub poll_interval_ms: i64,
    pub next_job_delay_ms: i64,
    pub concurrency: usize,
    pub lease: LeaseConfig,
    pub retry: RetryConfig,
    pub worker_loop_retry: WorkerLoopRetryConfig,
}

impl ExecutorConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval_ms: 5_000,
            next_job_delay_ms: 0,
            concurrency: 1,
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            worker_loop_retry: WorkerLoopRetryConfig::default(),
        }
    }
}

/// Deduplication request configuration (§4.6) — duplicated here as a plain
/// config type distinct from [`crate::model::DeduplicationSpec`] so callers
/// building an `ExecutorConfig`-style options bag have a consistent
/// `...Config` naming convention; the two are structurally identical.
pub use crate::model::DeduplicationSpec as DeduplicationConfig;

/// `waitForJobChainCompletion` polling/timeout configuration (§4.8).
#[derive(Debug, Clone)]
pub struct WaitForChainConfig {
    pub poll_interval_ms: i64,
    pub timeout_ms: i64,
}

impl Default for WaitForChainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            timeout_ms: 30_000,
        }
    }
}
