//! Pipeline composition: an ordered chain of strategies around one operation.
//!
//! The pipeline is an explicit chain-of-responsibility. Each strategy
//! implements one `execute`-shaped capability and delegates to [`Next`], the
//! remainder of the chain; the terminal step invokes the caller's operation
//! and classifies its raw result exactly once. The pipeline itself holds no
//! mutable state beyond the ordered strategy list, so a single instance is
//! safe to share across concurrent callers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bulkhead::{BulkheadConfig, BulkheadStrategy};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerStrategy};
use crate::error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
use crate::fallback::FallbackStrategy;
use crate::outcome::{classifiers::HandleAll, Outcome, OutcomeClassifier};
use crate::retry::{RetryConfig, RetryStrategy};
use crate::telemetry::{AttemptReport, NoopTelemetry, TelemetryHook};
use crate::timeout::TimeoutStrategy;

/// Per-attempt metadata handed to the operation and the telemetry hook.
///
/// Created fresh for every attempt and discarded afterwards; never shared
/// between attempts or between concurrent `execute` calls.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    attempt: u32,
    elapsed: Duration,
    isolation_key: Arc<str>,
}

impl AttemptContext {
    /// Attempt index within the current execution, starting at 0.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Elapsed time since the pipeline execution started.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The isolation key scoping bulkhead and circuit state.
    pub fn isolation_key(&self) -> &str {
        &self.isolation_key
    }
}

/// Call-scoped execution state threaded through the strategy chain.
///
/// Cloning is cheap; a timeout layer clones the context with a child
/// cancellation token while the attempt counter stays shared.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    isolation_key: Arc<str>,
    started_at: Instant,
    attempt: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    fn new(isolation_key: Arc<str>, cancel: CancellationToken) -> Self {
        Self { isolation_key, started_at: Instant::now(), attempt: Arc::new(AtomicU32::new(0)), cancel }
    }

    /// The isolation key this execution is scoped to.
    pub fn isolation_key(&self) -> &Arc<str> {
        &self.isolation_key
    }

    /// The cancellation token governing this execution (or this timeout
    /// scope, inside a timeout layer).
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Index of the attempt currently executing (0-based).
    pub fn attempt_index(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Advance to the next attempt; returns the index that just finished.
    pub(crate) fn bump_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::AcqRel)
    }

    /// Build the per-attempt metadata snapshot for the current attempt.
    pub fn attempt_context(&self) -> AttemptContext {
        AttemptContext {
            attempt: self.attempt_index(),
            elapsed: self.started_at.elapsed(),
            isolation_key: Arc::clone(&self.isolation_key),
        }
    }

    /// Clone the context with a different cancellation token, keeping the
    /// shared attempt counter and start time.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            isolation_key: Arc::clone(&self.isolation_key),
            started_at: self.started_at,
            attempt: Arc::clone(&self.attempt),
            cancel,
        }
    }
}

/// A unit of work wrapped by the pipeline.
///
/// Blanket-implemented for async closures taking the attempt context and the
/// cancellation token, so plain `|ctx, cancel| async move { .. }` works.
#[async_trait]
pub trait Operation<T, E>: Send + Sync
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn invoke(&self, ctx: &AttemptContext, cancel: &CancellationToken) -> Result<T, E>;
}

#[async_trait]
impl<T, E, F, Fut> Operation<T, E> for F
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(AttemptContext, CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
{
    async fn invoke(&self, ctx: &AttemptContext, cancel: &CancellationToken) -> Result<T, E> {
        (self)(ctx.clone(), cancel.clone()).await
    }
}

/// One layer in the pipeline.
///
/// A strategy either short-circuits (rejecting, timing out, substituting a
/// fallback) or delegates to `next`, possibly more than once (retry).
#[async_trait]
pub trait Strategy<T, E>: Send + Sync
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Stable layer name used in telemetry reports.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &ExecutionContext, next: Next<'_, T, E>) -> PipelineResult<T, E>;
}

/// The remainder of the strategy chain, ending in the classified operation.
pub struct Next<'a, T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    chain: &'a [Arc<dyn Strategy<T, E>>],
    operation: &'a dyn Operation<T, E>,
    classifier: &'a dyn OutcomeClassifier<T, E>,
    telemetry: &'a dyn TelemetryHook,
}

impl<T, E> Clone for Next<'_, T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            chain: self.chain,
            operation: self.operation,
            classifier: self.classifier,
            telemetry: self.telemetry,
        }
    }
}

impl<T, E> Next<'_, T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub(crate) fn telemetry(&self) -> &dyn TelemetryHook {
        self.telemetry
    }

    /// Run the rest of the chain. Retry layers call this repeatedly; attempts
    /// within one execution are strictly sequential.
    pub async fn run(&self, ctx: &ExecutionContext) -> PipelineResult<T, E> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    operation: self.operation,
                    classifier: self.classifier,
                    telemetry: self.telemetry,
                };
                head.execute(ctx, next).await
            }
            None => self.invoke_and_classify(ctx).await,
        }
    }

    /// Terminal step: invoke the operation once and classify the raw result.
    async fn invoke_and_classify(&self, ctx: &ExecutionContext) -> PipelineResult<T, E> {
        let attempt_ctx = ctx.attempt_context();
        if ctx.cancel().is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancel().cancelled() => {
                self.telemetry.on_attempt(
                    &attempt_ctx,
                    &AttemptReport::new("operation", crate::outcome::OutcomeKind::Cancelled),
                );
                return Err(PipelineError::Cancelled);
            }
            result = self.operation.invoke(&attempt_ctx, ctx.cancel()) => result,
        };

        let outcome = self.classifier.classify(result);
        self.telemetry.on_attempt(&attempt_ctx, &AttemptReport::new("operation", outcome.kind()));

        match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::HandledFailure(error) => Err(PipelineError::Handled { source: error }),
            Outcome::UnhandledFault(error) => Err(PipelineError::Unhandled { source: error }),
        }
    }
}

enum Layer<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Bulkhead(BulkheadConfig),
    TotalTimeout(Duration),
    CircuitBreaker(CircuitBreakerConfig),
    Retry(RetryConfig),
    AttemptTimeout(Duration),
    Ready(Arc<dyn Strategy<T, E>>),
}

/// Builder composing strategies outermost-first in call order.
///
/// The call order is the wrapping order: a bulkhead added before a timeout
/// rejects before the timeout clock even starts. Place `attempt_timeout`
/// after `retry` so the deadline resets on every attempt, and
/// `total_timeout` before it so one deadline spans all attempts.
pub struct ResiliencePipelineBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    isolation_key: Arc<str>,
    classifier: Arc<dyn OutcomeClassifier<T, E>>,
    telemetry: Arc<dyn TelemetryHook>,
    layers: Vec<Layer<T, E>>,
}

impl<T, E> Default for ResiliencePipelineBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> ResiliencePipelineBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            isolation_key: Arc::from("default"),
            classifier: Arc::new(HandleAll),
            telemetry: Arc::new(NoopTelemetry),
            layers: Vec::new(),
        }
    }

    /// Scope circuit and bulkhead state to one logical downstream dependency.
    pub fn isolation_key(mut self, key: impl AsRef<str>) -> Self {
        self.isolation_key = Arc::from(key.as_ref());
        self
    }

    /// Replace the default classify-everything-as-handled classifier.
    pub fn classifier(mut self, classifier: impl OutcomeClassifier<T, E> + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Install a telemetry hook invoked after every attempt at every layer.
    pub fn telemetry(mut self, telemetry: impl TelemetryHook + 'static) -> Self {
        self.telemetry = Arc::new(telemetry);
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.layers.push(Layer::Bulkhead(config));
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.layers.push(Layer::TotalTimeout(timeout));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.layers.push(Layer::CircuitBreaker(config));
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.layers.push(Layer::Retry(config));
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.layers.push(Layer::AttemptTimeout(timeout));
        self
    }

    /// Substitute a fallback value when the final fault matches the predicate.
    pub fn fallback<P, G>(mut self, predicate: P, produce: G) -> Self
    where
        P: Fn(&PipelineError<E>) -> bool + Send + Sync + 'static,
        G: Fn(&PipelineError<E>) -> T + Send + Sync + 'static,
    {
        self.layers.push(Layer::Ready(Arc::new(FallbackStrategy::new(predicate, produce))));
        self
    }

    /// Add a custom strategy layer.
    pub fn strategy(mut self, strategy: Arc<dyn Strategy<T, E>>) -> Self {
        self.layers.push(Layer::Ready(strategy));
        self
    }

    /// Validate every layer configuration and assemble the pipeline.
    pub fn build(self) -> ConfigResult<ResiliencePipeline<T, E>> {
        let mut strategies: Vec<Arc<dyn Strategy<T, E>>> = Vec::with_capacity(self.layers.len());
        for layer in self.layers {
            let strategy: Arc<dyn Strategy<T, E>> = match layer {
                Layer::Bulkhead(config) => Arc::new(BulkheadStrategy::new(config)?),
                Layer::CircuitBreaker(config) => Arc::new(CircuitBreakerStrategy::new(config)?),
                Layer::Retry(config) => Arc::new(RetryStrategy::new(config)?),
                Layer::TotalTimeout(timeout) => {
                    if timeout.is_zero() {
                        return Err(ConfigError::invalid("total_timeout must be non-zero"));
                    }
                    Arc::new(TimeoutStrategy::total(timeout))
                }
                Layer::AttemptTimeout(timeout) => {
                    if timeout.is_zero() {
                        return Err(ConfigError::invalid("attempt_timeout must be non-zero"));
                    }
                    Arc::new(TimeoutStrategy::per_attempt(timeout))
                }
                Layer::Ready(strategy) => strategy,
            };
            strategies.push(strategy);
        }

        Ok(ResiliencePipeline {
            isolation_key: self.isolation_key,
            classifier: self.classifier,
            telemetry: self.telemetry,
            strategies,
        })
    }
}

/// An immutable, shareable chain of resilience strategies around one
/// execution contract.
pub struct ResiliencePipeline<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    isolation_key: Arc<str>,
    classifier: Arc<dyn OutcomeClassifier<T, E>>,
    telemetry: Arc<dyn TelemetryHook>,
    strategies: Vec<Arc<dyn Strategy<T, E>>>,
}

impl<T, E> ResiliencePipeline<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ResiliencePipelineBuilder<T, E> {
        ResiliencePipelineBuilder::new()
    }

    /// The isolation key this pipeline scopes shared strategy state to.
    pub fn isolation_key(&self) -> &str {
        &self.isolation_key
    }

    /// Execute one operation through the strategy chain.
    ///
    /// Safe to call concurrently from many tasks; every call gets its own
    /// attempt counter and context while circuit and bulkhead state stay
    /// shared. The final outcome is the operation's value, a fallback value,
    /// or the fault of whichever control rejected the call.
    pub async fn execute<O>(&self, operation: &O, cancel: CancellationToken) -> PipelineResult<T, E>
    where
        O: Operation<T, E>,
    {
        let ctx = ExecutionContext::new(Arc::clone(&self.isolation_key), cancel);
        let next = Next {
            chain: &self.strategies,
            operation,
            classifier: self.classifier.as_ref(),
            telemetry: self.telemetry.as_ref(),
        };
        next.run(&ctx).await
    }
}
