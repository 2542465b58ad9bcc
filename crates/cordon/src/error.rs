//! Fault taxonomy shared by every strategy layer.
//!
//! Classification happens exactly once, at the boundary between the wrapped
//! operation and the innermost strategy. Every layer above acts only on the
//! kinds it is designed to handle and passes everything else through
//! unchanged; no layer ever converts a handled failure into an unhandled
//! fault or vice versa.

use std::time::Duration;

use thiserror::Error;

use crate::outcome::OutcomeKind;

/// Simple configuration error for builder validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type using simple config errors.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Faults produced by a pipeline execution.
///
/// Generic over the wrapped operation's error type `E` so the original error
/// is preserved as a source rather than stringified. The final value returned
/// to the caller always identifies which control rejected the call (timeout,
/// circuit, bulkhead, retries exhausted, cancellation) — never an opaque
/// generic error.
#[derive(Debug)]
pub enum PipelineError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The operation failed and the classifier deemed the failure eligible
    /// for retry and circuit accounting.
    Handled { source: E },

    /// The operation raised a fault the classifier refuses to handle; it
    /// propagates immediately, bypassing retry and circuit accounting.
    Unhandled { source: E },

    /// Every retry attempt was consumed; the final attempt's fault is kept
    /// as the source.
    RetriesExhausted { attempts: u32, source: Box<PipelineError<E>> },

    /// A timeout layer expired before the inner chain completed.
    Timeout { timeout: Duration },

    /// The circuit breaker for the isolation key is open, rejecting calls.
    CircuitOpen { key: String },

    /// The bulkhead is saturated and its queue (if any) is full.
    BulkheadRejected { max_concurrency: usize },

    /// The caller's cancellation signal fired.
    Cancelled,
}

// `Display` and `Error` are written by hand instead of derived: thiserror's
// derive infers a `Box<PipelineError<E>>: Error` bound for the recursive
// `RetriesExhausted` source, which the trait solver cannot resolve at generic
// call sites (E0275 overflow).
impl<E> std::fmt::Display for PipelineError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handled { .. } => write!(f, "operation failed with a handled failure"),
            Self::Unhandled { .. } => write!(f, "operation raised an unhandled fault"),
            Self::RetriesExhausted { attempts, .. } => {
                write!(f, "all {attempts} attempts exhausted")
            }
            Self::Timeout { timeout } => write!(f, "operation timed out after {timeout:?}"),
            Self::CircuitOpen { key } => {
                write!(f, "circuit breaker is open for '{key}', rejecting calls")
            }
            Self::BulkheadRejected { max_concurrency } => write!(
                f,
                "bulkhead rejected the call: {max_concurrency} operations in flight and queue full"
            ),
            Self::Cancelled => write!(f, "execution cancelled by caller"),
        }
    }
}

impl<E> std::error::Error for PipelineError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handled { source } | Self::Unhandled { source } => Some(source),
            Self::RetriesExhausted { source, .. } => Some(source.as_ref()),
            Self::Timeout { .. }
            | Self::CircuitOpen { .. }
            | Self::BulkheadRejected { .. }
            | Self::Cancelled => None,
        }
    }
}

impl<E> PipelineError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The value-free tag for this fault, used by telemetry reporting.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Handled { .. } => OutcomeKind::HandledFailure,
            Self::Unhandled { .. } => OutcomeKind::UnhandledFault,
            Self::RetriesExhausted { .. } => OutcomeKind::RetriesExhausted,
            Self::Timeout { .. } => OutcomeKind::Timeout,
            Self::CircuitOpen { .. } => OutcomeKind::CircuitOpen,
            Self::BulkheadRejected { .. } => OutcomeKind::BulkheadRejected,
            Self::Cancelled => OutcomeKind::Cancelled,
        }
    }

    /// Whether a retry layer may re-execute after this fault.
    ///
    /// Handled failures and per-attempt timeouts are retry-eligible.
    /// Circuit-open and bulkhead rejections are fail-fast signals and must
    /// never be retried; cancellation and unhandled faults propagate
    /// immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handled { .. } | Self::Timeout { .. })
    }

    /// Whether a circuit breaker records this fault in its failure window.
    ///
    /// Unhandled faults bypass circuit accounting entirely, and control-plane
    /// rejections (open circuit, full bulkhead, cancellation) say nothing
    /// about the health of the downstream dependency.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::Handled { .. } | Self::Timeout { .. } | Self::RetriesExhausted { .. }
        )
    }
}

/// Result type for pipeline executions.
pub type PipelineResult<T, E> = Result<T, PipelineError<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct TestError;

    #[test]
    fn config_error_display() {
        let err = ConfigError::invalid("bad value");
        assert!(err.to_string().contains("bad value"));
    }

    #[test]
    fn kinds_map_one_to_one() {
        let err: PipelineError<TestError> = PipelineError::Handled { source: TestError };
        assert_eq!(err.kind(), OutcomeKind::HandledFailure);

        let err: PipelineError<TestError> = PipelineError::Cancelled;
        assert_eq!(err.kind(), OutcomeKind::Cancelled);

        let err: PipelineError<TestError> =
            PipelineError::Timeout { timeout: Duration::from_secs(1) };
        assert_eq!(err.kind(), OutcomeKind::Timeout);
    }

    #[test]
    fn retry_eligibility_follows_propagation_policy() {
        let handled: PipelineError<TestError> = PipelineError::Handled { source: TestError };
        assert!(handled.is_retryable());

        let unhandled: PipelineError<TestError> = PipelineError::Unhandled { source: TestError };
        assert!(!unhandled.is_retryable());

        let open: PipelineError<TestError> = PipelineError::CircuitOpen { key: "svc".into() };
        assert!(!open.is_retryable());

        let rejected: PipelineError<TestError> =
            PipelineError::BulkheadRejected { max_concurrency: 2 };
        assert!(!rejected.is_retryable());

        let cancelled: PipelineError<TestError> = PipelineError::Cancelled;
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn breaker_accounting_ignores_control_plane_faults() {
        let handled: PipelineError<TestError> = PipelineError::Handled { source: TestError };
        assert!(handled.counts_as_breaker_failure());

        let exhausted: PipelineError<TestError> = PipelineError::RetriesExhausted {
            attempts: 3,
            source: Box::new(PipelineError::Handled { source: TestError }),
        };
        assert!(exhausted.counts_as_breaker_failure());

        let unhandled: PipelineError<TestError> = PipelineError::Unhandled { source: TestError };
        assert!(!unhandled.counts_as_breaker_failure());

        let open: PipelineError<TestError> = PipelineError::CircuitOpen { key: "svc".into() };
        assert!(!open.counts_as_breaker_failure());
    }

    #[test]
    fn retries_exhausted_preserves_final_fault() {
        let err: PipelineError<TestError> = PipelineError::RetriesExhausted {
            attempts: 4,
            source: Box::new(PipelineError::Handled { source: TestError }),
        };
        assert!(err.to_string().contains("4 attempts"));
        let source = std::error::Error::source(&err).expect("source should be preserved");
        assert!(source.to_string().contains("handled failure"));
    }
}
