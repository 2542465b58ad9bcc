//! Bulkhead strategy bounding concurrent executions.
//!
//! Slots are scoped per isolation key, mirroring the circuit breaker: a
//! semaphore caps the number of in-flight executions for each key, so a
//! strategy instance shared across pipelines keeps their dependencies
//! isolated from one another. Callers arriving beyond the cap wait in a
//! bounded queue; once the queue is full, further callers are rejected
//! immediately so saturation shows up as fast failures instead of unbounded
//! queueing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
use crate::outcome::OutcomeKind;
use crate::pipeline::{ExecutionContext, Next, Strategy};
use crate::telemetry::AttemptReport;

/// Configuration for the bulkhead strategy.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum number of executions allowed in flight at once per key.
    pub max_concurrency: usize,
    /// How many callers may wait for a slot once the bulkhead is full.
    /// Zero means reject immediately on saturation.
    pub max_queue_depth: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrency: 10, max_queue_depth: 0 }
    }
}

impl BulkheadConfig {
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadConfig`].
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.config.max_queue_depth = max_queue_depth;
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time snapshot of one key's bulkhead counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub max_concurrency: usize,
    pub available_slots: usize,
    pub queued: usize,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

/// Per-key slot accounting.
#[derive(Debug)]
struct BulkheadCell {
    semaphore: Semaphore,
    queued: AtomicUsize,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl BulkheadCell {
    fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrency),
            queued: AtomicUsize::new(0),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }
}

/// Strategy layer isolating the chain below it behind per-key concurrency
/// caps.
///
/// Cells are created lazily, one per isolation key, and live for the
/// lifetime of the strategy. Pipelines sharing a strategy instance share
/// slots only for equal keys.
#[derive(Debug)]
pub struct BulkheadStrategy {
    config: BulkheadConfig,
    cells: DashMap<Arc<str>, Arc<BulkheadCell>>,
}

impl BulkheadStrategy {
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, cells: DashMap::new() })
    }

    fn cell_for(&self, key: &Arc<str>) -> Arc<BulkheadCell> {
        if let Some(cell) = self.cells.get(key) {
            return Arc::clone(&cell);
        }
        Arc::clone(
            &self
                .cells
                .entry(Arc::clone(key))
                .or_insert_with(|| Arc::new(BulkheadCell::new(self.config.max_concurrency))),
        )
    }

    /// Snapshot of the counters for `key`, if any call has used it yet.
    pub fn metrics_for(&self, key: &str) -> Option<BulkheadMetrics> {
        self.cells.get(key).map(|cell| BulkheadMetrics {
            max_concurrency: self.config.max_concurrency,
            available_slots: cell.semaphore.available_permits(),
            queued: cell.queued.load(Ordering::Acquire),
            total_calls: cell.total_calls.load(Ordering::Acquire),
            rejected_calls: cell.rejected_calls.load(Ordering::Acquire),
        })
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for BulkheadStrategy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "bulkhead"
    }

    async fn execute(&self, ctx: &ExecutionContext, next: Next<'_, T, E>) -> PipelineResult<T, E> {
        let cell = self.cell_for(ctx.isolation_key());
        cell.total_calls.fetch_add(1, Ordering::AcqRel);

        let permit = match cell.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                // Saturated; claim a queue slot or reject. fetch_add before
                // the bound check keeps the claim atomic under contention.
                let waiting = cell.queued.fetch_add(1, Ordering::AcqRel);
                if waiting >= self.config.max_queue_depth {
                    cell.queued.fetch_sub(1, Ordering::AcqRel);
                    cell.rejected_calls.fetch_add(1, Ordering::AcqRel);
                    warn!(
                        key = %ctx.isolation_key(),
                        max_concurrency = self.config.max_concurrency,
                        max_queue_depth = self.config.max_queue_depth,
                        "bulkhead saturated, rejecting call"
                    );
                    next.telemetry().on_attempt(
                        &ctx.attempt_context(),
                        &AttemptReport::new("bulkhead", OutcomeKind::BulkheadRejected),
                    );
                    return Err(PipelineError::BulkheadRejected {
                        max_concurrency: self.config.max_concurrency,
                    });
                }

                let acquired = tokio::select! {
                    biased;
                    _ = ctx.cancel().cancelled() => None,
                    permit = cell.semaphore.acquire() => permit.ok(),
                };
                cell.queued.fetch_sub(1, Ordering::AcqRel);
                match acquired {
                    Some(permit) => permit,
                    // The semaphore is never closed, so a missing permit can
                    // only mean cancellation won the race.
                    None => return Err(PipelineError::Cancelled),
                }
            }
        };

        let result = next.run(ctx).await;
        drop(permit);
        result
    }
}
