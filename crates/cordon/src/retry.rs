//! Retry strategy with configurable backoff.
//!
//! Re-executes the inner chain after retry-eligible faults (handled failures
//! and per-attempt timeouts). Fail-fast signals from an open circuit or a
//! saturated bulkhead are never retried, and cancellation interrupts a backoff
//! sleep immediately.

use async_trait::async_trait;
use tracing::debug;

use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
use crate::pipeline::{ExecutionContext, Next, Strategy};
use crate::telemetry::AttemptReport;

/// Configuration for the retry strategy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempt budget including the first attempt. Must be at least 1;
    /// a value of 1 disables retrying entirely.
    pub max_attempts: u32,
    /// Delay policy between consecutive attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: BackoffPolicy::default() }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        self.backoff.validate()
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Strategy layer that re-runs the inner chain on retry-eligible faults.
#[derive(Debug)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for RetryStrategy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn execute(&self, ctx: &ExecutionContext, next: Next<'_, T, E>) -> PipelineResult<T, E> {
        let max_attempts = self.config.max_attempts;
        loop {
            let error = match next.run(ctx).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let consumed = ctx.attempt_index() + 1;
            if !error.is_retryable() {
                return Err(error);
            }
            if consumed >= max_attempts {
                if max_attempts > 1 {
                    return Err(PipelineError::RetriesExhausted {
                        attempts: max_attempts,
                        source: Box::new(error),
                    });
                }
                // A budget of one attempt means retrying is disabled; the
                // fault passes through unwrapped.
                return Err(error);
            }

            let delay = self.config.backoff.delay_for(ctx.attempt_index());
            debug!(
                key = %ctx.isolation_key(),
                attempt = ctx.attempt_index(),
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );
            next.telemetry().on_attempt(
                &ctx.attempt_context(),
                &AttemptReport::new("retry", error.kind())
                    .with_detail(format!("retrying after {delay:?}")),
            );
            ctx.bump_attempt();

            tokio::select! {
                biased;
                _ = ctx.cancel().cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
