//! Fallback strategy substituting a degraded value for matching faults.
//!
//! Placed outermost, it sees the final fault of everything below: exhausted
//! retries, open circuits, bulkhead rejections, timeouts. Cancellation is the
//! caller's own signal and always propagates unsubstituted.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{ExecutionContext, Next, Strategy};
use crate::telemetry::AttemptReport;

type Predicate<E> = Box<dyn Fn(&PipelineError<E>) -> bool + Send + Sync>;
type Producer<T, E> = Box<dyn Fn(&PipelineError<E>) -> T + Send + Sync>;

/// Strategy layer producing a substitute value when the inner chain fails.
pub struct FallbackStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    predicate: Predicate<E>,
    produce: Producer<T, E>,
}

impl<T, E> FallbackStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Substitute when `predicate` matches the final fault, using `produce`
    /// to build the replacement value.
    pub fn new<P, G>(predicate: P, produce: G) -> Self
    where
        P: Fn(&PipelineError<E>) -> bool + Send + Sync + 'static,
        G: Fn(&PipelineError<E>) -> T + Send + Sync + 'static,
    {
        Self { predicate: Box::new(predicate), produce: Box::new(produce) }
    }

    /// Substitute a fixed value for every fault.
    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(|_| true, move |_| value.clone())
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for FallbackStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn execute(&self, ctx: &ExecutionContext, next: Next<'_, T, E>) -> PipelineResult<T, E> {
        let error = match next.run(ctx).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if matches!(error, PipelineError::Cancelled) || !(self.predicate)(&error) {
            return Err(error);
        }

        debug!(
            key = %ctx.isolation_key(),
            fault = %error.kind(),
            "substituting fallback value"
        );
        next.telemetry().on_attempt(
            &ctx.attempt_context(),
            &AttemptReport::new("fallback", error.kind()).with_detail("substituted fallback value"),
        );
        Ok((self.produce)(&error))
    }
}
