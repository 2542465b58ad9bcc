//! Composable resilience strategies for outbound calls.
//!
//! A [`ResiliencePipeline`] wraps one async operation in an ordered chain of
//! strategies: bulkhead, timeout, circuit breaker, retry and fallback. The
//! composition order is explicit and under caller control, raw results are
//! classified exactly once at the boundary, and cross-call state (circuit
//! windows, bulkhead slots) is scoped by isolation key.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cordon::{BackoffPolicy, CircuitBreakerConfig, ResiliencePipeline, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("transport error")]
//! # struct TransportError;
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline: ResiliencePipeline<String, TransportError> = ResiliencePipeline::builder()
//!     .isolation_key("billing-api")
//!     .total_timeout(Duration::from_secs(10))
//!     .circuit_breaker(CircuitBreakerConfig::default())
//!     .retry(RetryConfig {
//!         max_attempts: 3,
//!         backoff: BackoffPolicy::default(),
//!     })
//!     .attempt_timeout(Duration::from_secs(2))
//!     .build()?;
//!
//! let _reply = pipeline
//!     .execute(
//!         &|_ctx, _cancel| async move { Ok("pong".to_string()) },
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! The [`IdempotencyGuard`] is orthogonal to the pipeline: it deduplicates
//! whole executions by caller-supplied key and can wrap a pipeline call or
//! any other future.

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod fallback;
pub mod idempotency;
pub mod outcome;
pub mod pipeline;
pub mod retry;
pub mod telemetry;
pub mod timeout;

pub use backoff::BackoffPolicy;
pub use bulkhead::{BulkheadConfig, BulkheadMetrics, BulkheadStrategy};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerStrategy, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
pub use fallback::FallbackStrategy;
pub use idempotency::{
    DuplicatePolicy, IdempotencyError, IdempotencyGuard, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use outcome::{Outcome, OutcomeClassifier, OutcomeKind};
pub use pipeline::{
    AttemptContext, ExecutionContext, Next, Operation, ResiliencePipeline,
    ResiliencePipelineBuilder, Strategy,
};
pub use retry::{RetryConfig, RetryStrategy};
pub use telemetry::{AttemptReport, NoopTelemetry, TelemetryHook, TracingTelemetry};
pub use timeout::TimeoutStrategy;
