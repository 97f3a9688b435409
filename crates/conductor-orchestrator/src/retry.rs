use crate::registry::Agent;
use conductor_core::{ConductorError, ConductorResult, ErrorKind, Parameters};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configures when and how long to wait before re-invoking a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, jitter included.
    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,
    /// Uniform random jitter added on top of the exponential term.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Failure kinds worth another attempt.
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_cap_delay_ms() -> u64 {
    30_000
}

fn default_max_jitter_ms() -> u64 {
    100
}

fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    [ErrorKind::Resource, ErrorKind::Timeout].into_iter().collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

impl RetryPolicy {
    /// Whether a failure of this kind may be retried. Validation, missing
    /// agents and cancellation never are, whatever the configured set says.
    /// Kinds outside the set fail closed.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        !kind.is_always_terminal() && self.retryable_kinds.contains(&kind)
    }

    /// Exponential term `min(cap, base * 2^retry_count)`, saturating.
    pub fn exponential_delay_ms(&self, retry_count: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count))
            .min(self.cap_delay_ms)
    }

    /// Delay before the retry following `retry_count` earlier retries.
    /// Never exceeds `cap_delay_ms`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        let delay = self
            .exponential_delay_ms(retry_count)
            .saturating_add(jitter)
            .min(self.cap_delay_ms);
        Duration::from_millis(delay)
    }
}

/// One scheduled retry, handed to the caller's observer before the wait.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// Retry number about to happen (1 for the first retry).
    pub retry: u32,
    pub delay: Duration,
    pub error: &'a ConductorError,
}

/// What happened across all attempts of one task invocation.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub result: ConductorResult<serde_json::Value>,
    pub retry_count: u32,
    pub attempts: u32,
}

/// Wraps agent invocations with failure classification and backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `agent` for a task until it succeeds, fails terminally, or
    /// `max_retries` retries are used up.
    ///
    /// The backoff wait is a tokio timer and yields to other tasks.
    /// Cancellation is checked before each retry and during the wait; an
    /// attempt already in flight always runs to completion.
    pub async fn invoke<F>(
        &self,
        agent: &dyn Agent,
        task_id: &str,
        parameters: &Parameters,
        max_retries: u32,
        cancel: &CancellationToken,
        mut on_retry: F,
    ) -> InvocationOutcome
    where
        F: FnMut(RetryEvent<'_>) + Send,
    {
        let mut retry_count = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            debug!(task_id = %task_id, agent = %agent.id(), attempt = attempts, "Invoking agent");

            let err = match agent.execute(task_id, parameters).await {
                Ok(value) => {
                    return InvocationOutcome {
                        result: Ok(value),
                        retry_count,
                        attempts,
                    }
                }
                Err(e) => e,
            };

            let kind = err.retry_kind();
            if !self.policy.is_retryable(kind) {
                warn!(
                    task_id = %task_id,
                    agent = %agent.id(),
                    attempt = attempts,
                    kind = %kind,
                    error = %err,
                    "Non-retryable failure"
                );
                return InvocationOutcome {
                    result: Err(err),
                    retry_count,
                    attempts,
                };
            }

            if retry_count >= max_retries {
                warn!(
                    task_id = %task_id,
                    agent = %agent.id(),
                    attempts,
                    error = %err,
                    "Retries exhausted"
                );
                return InvocationOutcome {
                    result: Err(err),
                    retry_count,
                    attempts,
                };
            }

            if cancel.is_cancelled() {
                return Self::cancelled(task_id, err, retry_count, attempts);
            }

            let delay = self.policy.backoff(retry_count);
            info!(
                task_id = %task_id,
                agent = %agent.id(),
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retryable failure, backing off"
            );
            on_retry(RetryEvent {
                retry: retry_count + 1,
                delay,
                error: &err,
            });
            retry_count += 1;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Self::cancelled(task_id, err, retry_count, attempts);
                }
            }
        }
    }

    fn cancelled(
        task_id: &str,
        last: ConductorError,
        retry_count: u32,
        attempts: u32,
    ) -> InvocationOutcome {
        info!(task_id = %task_id, attempts, "Retry abandoned after cancellation");
        InvocationOutcome {
            result: Err(ConductorError::Cancelled(format!(
                "retry of task '{task_id}' cancelled; last error: {last}"
            ))),
            retry_count,
            attempts,
        }
    }
}
