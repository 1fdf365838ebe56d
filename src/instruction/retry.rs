//! Conflict retries for read-modify-write calls

use crate::client::ClientError;
use crate::instruction::ApplyError;
use rand::Rng;
use slog::{warn, Logger};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff applied to optimistic-concurrency conflicts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub steps: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after every conflict
    pub factor: f64,

    /// Upper bound of the random extra delay, as a fraction of the current delay
    pub jitter: f64,

    /// Ceiling for the delay before jitter
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up on the first conflict
    pub fn no_retry() -> Self {
        Self {
            steps: 1,
            ..Self::default()
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    fn next_backoff(&self, backoff: Duration) -> Duration {
        let factor = if self.factor.is_finite() && self.factor > 0.0 {
            self.factor
        } else {
            1.0
        };
        Duration::try_from_secs_f64(backoff.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn with_jitter_applied(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || !self.jitter.is_finite() {
            return delay;
        }
        let extra = rand::thread_rng().gen::<f64>() * self.jitter;
        delay + Duration::try_from_secs_f64(delay.as_secs_f64() * extra).unwrap_or_default()
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error or runs out of attempts
///
/// Each attempt must re-read the remote state itself; this only decides whether and when
/// to try again.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    logger: &Logger,
    mut operation: F,
) -> Result<T, ApplyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let steps = policy.steps.max(1);
    let mut attempts = 0;
    let mut backoff = policy.initial_delay.min(policy.max_delay);

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                attempts += 1;
                if attempts >= steps {
                    return Err(ApplyError::RetriesExhausted { attempts, last: err });
                }

                let delay = policy.with_jitter_applied(backoff);
                warn!(logger, "Write conflict, retrying";
                    "attempt" => attempts,
                    "delay_ms" => delay.as_millis() as u64,
                    "error" => %err
                );
                tokio::time::sleep(delay).await;
                backoff = policy.next_backoff(backoff);
            }
            Err(err) => return Err(ApplyError::Client(err)),
        }
    }
}
