//! Orchestrator configuration.
//!
//! Defaults are sensible for tests and small deployments; production
//! overrides come from the environment (loaded through `dotenvy`, so a
//! `.env` file works too).

use std::time::Duration;

/// Bounded-retry policy with exponential backoff.
///
/// Node-level (graph) retries and worker-level (content) retries are two
/// independent instances of this, configured separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never zero.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub backoff_base: Duration,
    /// Ceiling for the backoff curve.
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap,
        }
    }

    /// Backoff before retry number `attempt` (1-based; attempt 1 is the
    /// first retry). Doubles per attempt, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.backoff_cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration for the orchestration core.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Retry policy for agent calls inside graph nodes.
    pub node_retry: RetryPolicy,
    /// Retry policy for agent calls inside content workers.
    pub worker_retry: RetryPolicy,
    /// Per-attempt budget for one content unit; expiry triggers a retry.
    pub soft_timeout: Duration,
    /// Whole-unit budget; expiry forces the unit to `failed`.
    pub hard_timeout: Duration,
    /// Number of content workers in the pool.
    pub worker_count: usize,
    /// Cap on simultaneously generating units for one task.
    pub per_task_concurrency: usize,
    /// How long a task may sit in-progress with no liveness signal before
    /// the reconciler may touch it.
    pub stale_grace: Duration,
    /// Broadcast buffer per task subscription channel.
    pub event_buffer_capacity: usize,
    /// SQLite URL for the durable stores, e.g. `sqlite://curricle.db`.
    pub sqlite_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_retry: RetryPolicy::default(),
            worker_retry: RetryPolicy::default(),
            soft_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(300),
            worker_count: 4,
            per_task_concurrency: 3,
            stale_grace: Duration::from_secs(180),
            event_buffer_capacity: 256,
            sqlite_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Recognized variables: `CURRICLE_SQLITE_URL`, `CURRICLE_WORKER_COUNT`,
    /// `CURRICLE_PER_TASK_CONCURRENCY`, `CURRICLE_STALE_GRACE_SECS`,
    /// `CURRICLE_SOFT_TIMEOUT_SECS`, `CURRICLE_HARD_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.sqlite_url = std::env::var("CURRICLE_SQLITE_URL").ok();
        if let Some(n) = env_parse::<usize>("CURRICLE_WORKER_COUNT") {
            config.worker_count = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("CURRICLE_PER_TASK_CONCURRENCY") {
            config.per_task_concurrency = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("CURRICLE_STALE_GRACE_SECS") {
            config.stale_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CURRICLE_SOFT_TIMEOUT_SECS") {
            config.soft_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CURRICLE_HARD_TIMEOUT_SECS") {
            config.hard_timeout = Duration::from_secs(secs);
        }
        config
    }

    #[must_use]
    pub fn with_node_retry(mut self, policy: RetryPolicy) -> Self {
        self.node_retry = policy;
        self
    }

    #[must_use]
    pub fn with_worker_retry(mut self, policy: RetryPolicy) -> Self {
        self.worker_retry = policy;
        self
    }

    #[must_use]
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
