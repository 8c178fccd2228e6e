use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for the reflector's list and watch calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Consecutive failures tolerated before the condition turns fatal.
    pub max_consecutive_failures: u32,
    /// A watch stream that stayed open this long counts as healthy and clears the failure count.
    pub healthy_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            factor: 2,
            max_consecutive_failures: 5,
            healthy_after: Duration::from_secs(10),
        }
    }
}

/// Runtime configuration for one informer. Built once and handed to constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Period of synthetic `Sync` passes; zero disables resync.
    pub resync_period: Duration,
    /// Number of processor shards.
    pub workers: usize,
    /// Capacity of each shard's input channel.
    pub worker_queue_cap: usize,
    /// Put a batch back on the queue when handing it to a worker fails.
    pub requeue_on_failure: bool,
    /// Depth step at which the unbounded queue logs a growth warning.
    pub queue_warn_depth: usize,
    /// Server-side watch timeout; the stream closes normally after it.
    pub watch_timeout_secs: u32,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub backoff: BackoffConfig,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(600),
            workers: 1,
            worker_queue_cap: 64,
            requeue_on_failure: true,
            queue_warn_depth: 10_000,
            watch_timeout_secs: 290,
            label_selector: None,
            field_selector: None,
            backoff: BackoffConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl InformerConfig {
    /// Defaults overridden by `KINFORM_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_parse::<u64>("KINFORM_RESYNC_SECS") {
            cfg.resync_period = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("KINFORM_WORKERS") {
            cfg.workers = n.max(1);
        }
        if let Some(secs) = env_parse::<u32>("KINFORM_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("KINFORM_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff.max = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("KINFORM_MAX_FAILURES") {
            cfg.backoff.max_consecutive_failures = n;
        }
        cfg
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}
