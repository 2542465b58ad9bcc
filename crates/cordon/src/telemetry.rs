//! Attempt-level telemetry hook.
//!
//! Strategies report every attempt outcome and every short-circuit decision
//! through an injected [`TelemetryHook`] so callers can wire metrics or audit
//! trails without this crate depending on a concrete observability system.

use tracing::{debug, warn};

use crate::outcome::OutcomeKind;
use crate::pipeline::AttemptContext;

/// What a strategy layer observed for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    /// Which layer produced the report (e.g. `"retry"`, `"circuit_breaker"`).
    pub layer: &'static str,
    /// The classified outcome kind.
    pub kind: OutcomeKind,
    /// Optional free-form detail, e.g. the scheduled backoff delay.
    pub detail: Option<String>,
}

impl AttemptReport {
    pub fn new(layer: &'static str, kind: OutcomeKind) -> Self {
        Self { layer, kind, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Injected callback invoked after every attempt at every strategy layer.
pub trait TelemetryHook: Send + Sync {
    fn on_attempt(&self, ctx: &AttemptContext, report: &AttemptReport);
}

/// Hook that discards every report (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {
    fn on_attempt(&self, _ctx: &AttemptContext, _report: &AttemptReport) {}
}

/// Hook that forwards reports to `tracing`.
///
/// Successes log at debug, everything else at warn.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_attempt(&self, ctx: &AttemptContext, report: &AttemptReport) {
        match report.kind {
            OutcomeKind::Success => debug!(
                key = %ctx.isolation_key(),
                attempt = ctx.attempt(),
                layer = report.layer,
                "attempt succeeded"
            ),
            kind => warn!(
                key = %ctx.isolation_key(),
                attempt = ctx.attempt(),
                layer = report.layer,
                outcome = %kind,
                detail = report.detail.as_deref().unwrap_or(""),
                "attempt did not succeed"
            ),
        }
    }
}

/// Hook implementation for closures, convenient in tests and small setups.
impl<F> TelemetryHook for F
where
    F: Fn(&AttemptContext, &AttemptReport) + Send + Sync,
{
    fn on_attempt(&self, ctx: &AttemptContext, report: &AttemptReport) {
        (self)(ctx, report);
    }
}
