//! Configuration for rollout runs

use crate::instruction::RetryPolicy;
use std::time::Duration;

/// Configuration for an [`Orchestrator`](crate::Orchestrator) run.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    /// Deadline covering the whole instruction sequence, not each instruction
    pub deadline: Duration,

    /// Time allowed for the compensating delete after a failed run
    pub cleanup_timeout: Duration,

    /// Backoff used by instructions that retry write conflicts
    pub retry: RetryPolicy,

    /// Log every observed snapshot change
    pub debug: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            cleanup_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            debug: false,
        }
    }
}

impl OrchestratorConfig {
    /// Set the overall run deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set how long the compensating delete may take.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Set the conflict retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable snapshot diff logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
