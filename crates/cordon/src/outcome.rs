//! Outcome classification for completed attempts.
//!
//! A classifier decides, once per attempt, whether a raw operation result
//! counts as a success, a handled failure (retry/breaker eligible) or an
//! unhandled fault that must propagate immediately. Classification is pure
//! and deterministic: the same raw result always yields the same outcome.

use std::fmt;

/// Classified result of a single attempt.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The attempt produced a usable value.
    Success(T),
    /// The attempt failed in a way the resilience controls are allowed to
    /// absorb (retry, record in the failure window, fall back).
    HandledFailure(E),
    /// The attempt failed in a way that must propagate to the caller
    /// untouched, bypassing retry and circuit accounting.
    UnhandledFault(E),
}

impl<T, E> Outcome<T, E> {
    /// The value-free tag for this outcome.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::HandledFailure(_) => OutcomeKind::HandledFailure,
            Self::UnhandledFault(_) => OutcomeKind::UnhandledFault,
        }
    }
}

/// Value-free outcome tag, reported through the telemetry hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    HandledFailure,
    UnhandledFault,
    RetriesExhausted,
    Timeout,
    CircuitOpen,
    BulkheadRejected,
    Cancelled,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::HandledFailure => "handled_failure",
            Self::UnhandledFault => "unhandled_fault",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// Trait for classifying a completed attempt.
///
/// Implementations must be pure: no side effects, no state, same answer for
/// the same input.
pub trait OutcomeClassifier<T, E>: Send + Sync {
    /// Classify the raw result of one attempt.
    fn classify(&self, result: Result<T, E>) -> Outcome<T, E>;
}

/// Pre-defined classifiers for common scenarios.
pub mod classifiers {
    use super::{Outcome, OutcomeClassifier};

    /// Treats every error as a handled failure (the default).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct HandleAll;

    impl<T, E> OutcomeClassifier<T, E> for HandleAll {
        fn classify(&self, result: Result<T, E>) -> Outcome<T, E> {
            match result {
                Ok(value) => Outcome::Success(value),
                Err(error) => Outcome::HandledFailure(error),
            }
        }
    }

    /// Treats every error as an unhandled fault; nothing is ever retried.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct HandleNone;

    impl<T, E> OutcomeClassifier<T, E> for HandleNone {
        fn classify(&self, result: Result<T, E>) -> Outcome<T, E> {
            match result {
                Ok(value) => Outcome::Success(value),
                Err(error) => Outcome::UnhandledFault(error),
            }
        }
    }

    /// Predicate-based classifier: errors matching the predicate are handled
    /// failures, all others are unhandled faults.
    #[derive(Debug)]
    pub struct PredicateClassifier<F> {
        predicate: F,
    }

    impl<F> PredicateClassifier<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<T, E, F> OutcomeClassifier<T, E> for PredicateClassifier<F>
    where
        F: Fn(&E) -> bool + Send + Sync,
    {
        fn classify(&self, result: Result<T, E>) -> Outcome<T, E> {
            match result {
                Ok(value) => Outcome::Success(value),
                Err(error) if (self.predicate)(&error) => Outcome::HandledFailure(error),
                Err(error) => Outcome::UnhandledFault(error),
            }
        }
    }
}
