//! Circuit breaker with a sliding failure window and half-open probing.
//!
//! Breaker state is shared per isolation key: every execution carrying the
//! same key reads and writes the same failure window, so one caller's
//! failures protect every other caller of the same dependency. State
//! transitions happen under a single mutex and consult the injected clock,
//! which keeps the whole state machine deterministic under test.
//!
//! Faults feed the window only when they say something about the dependency:
//! handled failures, timeouts and exhausted retries count, while unhandled
//! faults, cancellations and control-plane rejections are ignored.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
use crate::outcome::OutcomeKind;
use crate::pipeline::{ExecutionContext, Next, Strategy};
use crate::telemetry::AttemptReport;

/// Configuration for the circuit breaker strategy.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in `(0, 1]` at which the circuit opens.
    pub failure_ratio_threshold: f64,
    /// Minimum samples in the window before the ratio is meaningful.
    pub minimum_sample_count: usize,
    /// Sliding window length; samples older than this are discarded.
    pub sampling_duration: Duration,
    /// How long an open circuit rejects calls before probing.
    pub break_duration: Duration,
    /// Consecutive trial successes required to close from half-open.
    pub half_open_trial_count: usize,
    /// Whether half-open trials run one at a time.
    pub serialized_trials: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.5,
            minimum_sample_count: 10,
            sampling_duration: Duration::from_secs(30),
            break_duration: Duration::from_secs(5),
            half_open_trial_count: 1,
            serialized_trials: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.failure_ratio_threshold > 0.0 && self.failure_ratio_threshold <= 1.0) {
            return Err(ConfigError::invalid("failure_ratio_threshold must be within (0, 1]"));
        }
        if self.minimum_sample_count == 0 {
            return Err(ConfigError::invalid("minimum_sample_count must be at least 1"));
        }
        if self.sampling_duration.is_zero() {
            return Err(ConfigError::invalid("sampling_duration must be non-zero"));
        }
        if self.break_duration.is_zero() {
            return Err(ConfigError::invalid("break_duration must be non-zero"));
        }
        if self.half_open_trial_count == 0 {
            return Err(ConfigError::invalid("half_open_trial_count must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_ratio_threshold(mut self, threshold: f64) -> Self {
        self.config.failure_ratio_threshold = threshold;
        self
    }

    pub fn minimum_sample_count(mut self, count: usize) -> Self {
        self.config.minimum_sample_count = count;
        self
    }

    pub fn sampling_duration(mut self, duration: Duration) -> Self {
        self.config.sampling_duration = duration;
        self
    }

    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.config.break_duration = duration;
        self
    }

    pub fn half_open_trial_count(mut self, count: usize) -> Self {
        self.config.half_open_trial_count = count;
        self
    }

    pub fn serialized_trials(mut self, serialized: bool) -> Self {
        self.config.serialized_trials = serialized;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally while outcomes feed the failure window.
    Closed,
    /// Calls are rejected until the break duration elapses.
    Open,
    /// A limited number of trial calls probe the dependency.
    HalfOpen,
}

/// Sliding window of attempt outcomes within the sampling duration.
#[derive(Debug)]
struct FailureWindow {
    samples: VecDeque<(Instant, bool)>,
    sampling_duration: Duration,
}

impl FailureWindow {
    fn new(sampling_duration: Duration) -> Self {
        Self { samples: VecDeque::new(), sampling_duration }
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.prune(now);
        self.samples.push_back((now, success));
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.sampling_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn failure_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|&&(_, success)| !success).count();
        failures as f64 / self.samples.len() as f64
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Point-in-time snapshot of one key's breaker state and counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub sample_count: usize,
    pub failure_ratio: f64,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub trials_in_flight: usize,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: FailureWindow,
    opened_at: Option<Instant>,
    trials_in_flight: usize,
    trial_successes: usize,
    total_calls: u64,
    rejected_calls: u64,
}

/// Shared breaker state machine for one isolation key.
#[derive(Debug)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    key: Arc<str>,
    inner: Mutex<BreakerInner>,
}

enum Admission {
    /// Call admitted; `trial` marks a half-open probe occupying a trial slot.
    Admitted { trial: bool },
    /// Circuit is open; `retry_after` is the remaining break time.
    Rejected { retry_after: Duration },
}

impl<C: Clock> CircuitBreaker<C> {
    fn new(config: CircuitBreakerConfig, clock: C, key: Arc<str>) -> Self {
        let window = FailureWindow::new(config.sampling_duration);
        Self {
            config,
            clock,
            key,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                trials_in_flight: 0,
                trial_successes: 0,
                total_calls: 0,
                rejected_calls: 0,
            }),
        }
    }

    /// Current state, after applying any due open-to-half-open promotion.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.state
    }

    fn promote_if_due(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let now = self.clock.now();
        let due = inner
            .opened_at
            .is_some_and(|at| now.duration_since(at) >= self.config.break_duration);
        if due {
            debug!(key = %self.key, "circuit half-open, admitting trial calls");
            inner.state = CircuitState::HalfOpen;
            inner.trials_in_flight = 0;
            inner.trial_successes = 0;
        }
    }

    fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.total_calls += 1;
        match inner.state {
            CircuitState::Closed => Admission::Admitted { trial: false },
            CircuitState::Open => {
                let now = self.clock.now();
                let retry_after = inner
                    .opened_at
                    .map(|at| self.config.break_duration.saturating_sub(now.duration_since(at)))
                    .unwrap_or(self.config.break_duration);
                inner.rejected_calls += 1;
                Admission::Rejected { retry_after }
            }
            CircuitState::HalfOpen => {
                let cap = if self.config.serialized_trials {
                    1
                } else {
                    self.config.half_open_trial_count
                };
                if inner.trials_in_flight >= cap {
                    // Trial slots are taken; everyone else keeps seeing the
                    // circuit as open.
                    inner.rejected_calls += 1;
                    Admission::Rejected { retry_after: Duration::ZERO }
                } else {
                    inner.trials_in_flight += 1;
                    Admission::Admitted { trial: true }
                }
            }
        }
    }

    /// Snapshot of the breaker's state and counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        let now = self.clock.now();
        inner.window.prune(now);
        CircuitBreakerMetrics {
            state: inner.state,
            sample_count: inner.window.sample_count(),
            failure_ratio: inner.window.failure_ratio(),
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            trials_in_flight: inner.trials_in_flight,
        }
    }

    fn record(&self, trial: bool, success: bool) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            if success {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_trial_count {
                    debug!(key = %self.key, "trial calls succeeded, closing circuit");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.window.clear();
                }
            } else {
                warn!(key = %self.key, "trial call failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_successes = 0;
            }
            return;
        }

        if inner.state != CircuitState::Closed {
            // Result of a call admitted before the state changed; the trial
            // machinery owns transitions now.
            return;
        }
        inner.window.record(now, success);
        if success {
            return;
        }
        let samples = inner.window.sample_count();
        let ratio = inner.window.failure_ratio();
        if samples >= self.config.minimum_sample_count
            && ratio >= self.config.failure_ratio_threshold
        {
            warn!(
                key = %self.key,
                samples,
                failure_ratio = ratio,
                "failure threshold crossed, opening circuit"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.window.clear();
        }
    }

    /// Release a trial slot without recording an outcome (abandoned call).
    fn release(&self, trial: bool) {
        if trial {
            let mut inner = self.inner.lock();
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

/// RAII admission ticket. Completing it records the outcome; dropping it
/// uncompleted releases any trial slot without touching the window.
struct CallGuard<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    trial: bool,
    done: bool,
}

impl<C: Clock> CallGuard<'_, C> {
    fn complete(mut self, success: bool) {
        self.done = true;
        self.breaker.record(self.trial, success);
    }
}

impl<C: Clock> Drop for CallGuard<'_, C> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.release(self.trial);
        }
    }
}

/// Strategy layer guarding the chain below it with per-key circuit breakers.
///
/// Breakers are created lazily, one per isolation key, and live for the
/// lifetime of the strategy. Pipelines sharing a strategy instance therefore
/// share breaker state for equal keys.
#[derive(Debug)]
pub struct CircuitBreakerStrategy<C: Clock + Clone = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    breakers: DashMap<Arc<str>, Arc<CircuitBreaker<C>>>,
}

impl CircuitBreakerStrategy<SystemClock> {
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock + Clone> CircuitBreakerStrategy<C> {
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, clock, breakers: DashMap::new() })
    }

    fn breaker_for(&self, key: &Arc<str>) -> Arc<CircuitBreaker<C>> {
        if let Some(breaker) = self.breakers.get(key) {
            return Arc::clone(&breaker);
        }
        Arc::clone(&self.breakers.entry(Arc::clone(key)).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(self.config.clone(), self.clock.clone(), Arc::clone(key)))
        }))
    }

    /// State of the breaker for `key`, if one exists yet.
    pub fn state_for(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|breaker| breaker.state())
    }

    /// Metrics snapshot for `key`, if a breaker exists yet.
    pub fn metrics_for(&self, key: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(key).map(|breaker| breaker.metrics())
    }
}

#[async_trait]
impl<T, E, C> Strategy<T, E> for CircuitBreakerStrategy<C>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    C: Clock + Clone,
{
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn execute(&self, ctx: &ExecutionContext, next: Next<'_, T, E>) -> PipelineResult<T, E> {
        let breaker = self.breaker_for(ctx.isolation_key());

        match breaker.try_admit() {
            Admission::Rejected { retry_after } => {
                next.telemetry().on_attempt(
                    &ctx.attempt_context(),
                    &AttemptReport::new("circuit_breaker", OutcomeKind::CircuitOpen)
                        .with_detail(format!("retry after {retry_after:?}")),
                );
                Err(PipelineError::CircuitOpen { key: ctx.isolation_key().to_string() })
            }
            Admission::Admitted { trial } => {
                let guard = CallGuard { breaker: &breaker, trial, done: false };
                let result = next.run(ctx).await;
                match &result {
                    Ok(_) => guard.complete(true),
                    Err(error) if error.counts_as_breaker_failure() => guard.complete(false),
                    // Unhandled faults, cancellation and control-plane
                    // rejections say nothing about dependency health.
                    Err(_) => drop(guard),
                }
                result
            }
        }
    }
}
