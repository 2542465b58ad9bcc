//! Timeout strategy with cooperative cancellation.
//!
//! Each timeout layer races the inner chain against a deadline. On expiry it
//! cancels a child token so the work below stops promptly, then surfaces a
//! timeout fault. Whether the deadline covers one attempt or the whole
//! execution is purely a matter of placement: below the retry layer the timer
//! restarts on every attempt, above it a single deadline spans them all.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{ExecutionContext, Next, Strategy};
use crate::telemetry::AttemptReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutScope {
    PerAttempt,
    Total,
}

/// Strategy layer that bounds the latency of the chain below it.
#[derive(Debug)]
pub struct TimeoutStrategy {
    timeout: Duration,
    scope: TimeoutScope,
}

impl TimeoutStrategy {
    /// Deadline restarting on every attempt; place below the retry layer.
    pub fn per_attempt(timeout: Duration) -> Self {
        Self { timeout, scope: TimeoutScope::PerAttempt }
    }

    /// Single deadline spanning all attempts; place above the retry layer.
    pub fn total(timeout: Duration) -> Self {
        Self { timeout, scope: TimeoutScope::Total }
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for TimeoutStrategy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        match self.scope {
            TimeoutScope::PerAttempt => "attempt_timeout",
            TimeoutScope::Total => "total_timeout",
        }
    }

    async fn execute(&self, ctx: &ExecutionContext, next: Next<'_, T, E>) -> PipelineResult<T, E> {
        // The child token lets this layer stop the work below it without
        // cancelling sibling scopes or the caller's token.
        let scoped_cancel = ctx.cancel().child_token();
        let inner_ctx = ctx.with_cancel(scoped_cancel.clone());

        tokio::select! {
            biased;
            _ = ctx.cancel().cancelled() => {
                scoped_cancel.cancel();
                Err(PipelineError::Cancelled)
            }
            result = next.run(&inner_ctx) => result,
            _ = tokio::time::sleep(self.timeout) => {
                scoped_cancel.cancel();
                warn!(
                    key = %ctx.isolation_key(),
                    attempt = ctx.attempt_index(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    layer = Strategy::<T, E>::name(self),
                    "deadline expired"
                );
                next.telemetry().on_attempt(
                    &ctx.attempt_context(),
                    &AttemptReport::new(Strategy::<T, E>::name(self), crate::outcome::OutcomeKind::Timeout)
                        .with_detail(format!("expired after {:?}", self.timeout)),
                );
                Err(PipelineError::Timeout { timeout: self.timeout })
            }
        }
    }
}
