//! Core configuration: concurrency, budgets, poll cadence, lock timing.

use std::time::Duration;

/// Multi-user coordination mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinationMode {
    /// Single-user: all lock operations are no-ops.
    #[default]
    Solo,
    /// Peer-to-peer: file locks with TTL and heartbeat are enforced.
    Peer,
}

/// Configuration for the orchestration core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum workers running at once.
    pub max_concurrent: usize,
    /// Orchestrator tick cadence.
    pub poll_interval: Duration,
    /// Default iteration budget per phase (overridable per phase).
    pub max_iterations: u32,
    /// Cross-phase retry budget per task.
    pub max_retries: u32,
    /// Per-task wall-clock limit; zero means unlimited.
    pub worker_timeout: Duration,
    /// Lock staleness threshold.
    pub lock_ttl: Duration,
    /// Heartbeat rewrite cadence.
    pub heartbeat_interval: Duration,
    /// Grace window between the graceful signal and the hard kill.
    pub kill_grace: Duration,
    /// Whether validator infrastructure failures fail the task
    /// (true) or are accepted fail-open (false).
    pub fail_on_api_error: bool,
    /// Lock coordination mode.
    pub mode: CoordinationMode,
    /// Bound on output tails carried in retry context and events.
    pub output_tail_bytes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_secs(2),
            max_iterations: 25,
            max_retries: 3,
            worker_timeout: Duration::ZERO,
            lock_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
            fail_on_api_error: false,
            mode: CoordinationMode::Solo,
            output_tail_bytes: 2000,
        }
    }
}

impl CoreConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_iterations(mut self, budget: u32) -> Self {
        self.max_iterations = budget;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_fail_on_api_error(mut self, fail: bool) -> Self {
        self.fail_on_api_error = fail;
        self
    }

    pub fn with_mode(mut self, mode: CoordinationMode) -> Self {
        self.mode = mode;
        self
    }
}
