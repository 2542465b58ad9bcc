//! Idempotency guard deduplicating executions by caller-supplied key.
//!
//! The first execution for a key runs the operation; a success is cached and
//! replayed to every later caller of the same key. While the first execution
//! is still in flight, duplicates either wait for its result or are rejected,
//! per policy. Failures are never cached, so a failed key is retryable the
//! moment the failing execution ends.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// How the guard treats a duplicate key whose first execution is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail the duplicate immediately.
    Reject,
    /// Suspend the duplicate until the first execution resolves, then share
    /// its cached value (or race to re-execute if it was abandoned).
    Wait,
}

/// What `try_begin` found for a key.
#[derive(Debug)]
pub enum BeginOutcome<T> {
    /// The caller now owns the execution for this key.
    Began,
    /// A previous execution succeeded; its value is replayed.
    Cached(T),
    /// Another execution for this key is still in flight.
    InProgress,
}

/// Keyed execution-dedup storage.
///
/// `complete` caches a success for replay; `abandon` clears an in-flight
/// claim after a failure so the key becomes retryable.
#[async_trait]
pub trait IdempotencyStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Atomically claim the key, returning the cached value or in-flight
    /// status instead if the key is already known.
    async fn try_begin(&self, key: &str) -> BeginOutcome<T>;

    /// Record a successful value for the key and wake any waiting duplicates.
    async fn complete(&self, key: &str, value: T);

    /// Drop the in-flight claim after a failure and wake any waiting
    /// duplicates so they can race to re-execute.
    async fn abandon(&self, key: &str);

    /// Wait until the in-flight execution for the key resolves. Returns the
    /// cached value, or `None` if the execution was abandoned.
    async fn await_completion(&self, key: &str) -> Option<T>;
}

enum Slot<T> {
    InProgress(Arc<Notify>),
    Completed(T),
}

/// Process-local [`IdempotencyStore`] backed by a concurrent map.
///
/// Entries live until `clear` is called; eviction policy is left to the
/// embedding application.
pub struct InMemoryIdempotencyStore<T> {
    slots: DashMap<String, Slot<T>>,
}

impl<T> Default for InMemoryIdempotencyStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryIdempotencyStore<T> {
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    /// Number of keys currently tracked (in flight or cached).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forget every key, cached values included.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

#[async_trait]
impl<T> IdempotencyStore<T> for InMemoryIdempotencyStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn try_begin(&self, key: &str) -> BeginOutcome<T> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Completed(value) => BeginOutcome::Cached(value.clone()),
                Slot::InProgress(_) => BeginOutcome::InProgress,
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::InProgress(Arc::new(Notify::new())));
                BeginOutcome::Began
            }
        }
    }

    async fn complete(&self, key: &str, value: T) {
        if let Some(Slot::InProgress(notify)) =
            self.slots.insert(key.to_string(), Slot::Completed(value))
        {
            notify.notify_waiters();
        }
    }

    async fn abandon(&self, key: &str) {
        if let Some((_, Slot::InProgress(notify))) = self.slots.remove(key) {
            notify.notify_waiters();
        }
    }

    async fn await_completion(&self, key: &str) -> Option<T> {
        loop {
            let notify = match self.slots.get(key).as_deref() {
                Some(Slot::Completed(value)) => return Some(value.clone()),
                Some(Slot::InProgress(notify)) => Arc::clone(notify),
                None => return None,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            // Register for the wakeup, then re-check: a completion landing
            // between the lookup above and this point must not be missed.
            notified.as_mut().enable();
            match self.slots.get(key).as_deref() {
                Some(Slot::Completed(value)) => return Some(value.clone()),
                Some(Slot::InProgress(_)) => {}
                None => return None,
            }
            notified.await;
        }
    }
}

/// Faults produced by an idempotency-guarded execution.
#[derive(Debug, Error)]
pub enum IdempotencyError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The key is already executing and the policy rejects duplicates.
    #[error("an execution for idempotency key '{key}' is already in flight")]
    DuplicateInProgress { key: String },

    /// The underlying operation failed; the key was left retryable.
    #[error("guarded operation failed")]
    Execution(#[source] E),
}

/// Entry point wrapping executions in keyed deduplication.
pub struct IdempotencyGuard<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: IdempotencyStore<T>,
{
    store: Arc<S>,
    policy: DuplicatePolicy,
    _value: std::marker::PhantomData<fn() -> T>,
}

impl<T, S> IdempotencyGuard<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: IdempotencyStore<T>,
{
    pub fn new(store: Arc<S>, policy: DuplicatePolicy) -> Self {
        Self { store, policy, _value: std::marker::PhantomData }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Execute `operation` at most once per key.
    ///
    /// Exactly one concurrent caller per key runs the operation; the rest
    /// observe its cached success, wait, or are rejected per policy. A
    /// failure propagates only to the caller that ran the operation.
    pub async fn execute<F, Fut, E>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            match self.store.try_begin(key).await {
                BeginOutcome::Began => {
                    match operation().await {
                        Ok(value) => {
                            self.store.complete(key, value.clone()).await;
                            return Ok(value);
                        }
                        Err(error) => {
                            self.store.abandon(key).await;
                            return Err(IdempotencyError::Execution(error));
                        }
                    }
                }
                BeginOutcome::Cached(value) => {
                    debug!(key, "replaying cached idempotent result");
                    return Ok(value);
                }
                BeginOutcome::InProgress => match self.policy {
                    DuplicatePolicy::Reject => {
                        return Err(IdempotencyError::DuplicateInProgress { key: key.to_string() });
                    }
                    DuplicatePolicy::Wait => {
                        if let Some(value) = self.store.await_completion(key).await {
                            return Ok(value);
                        }
                        // The owner abandoned after a failure. Loop so this
                        // caller races to claim the key and run its own
                        // operation.
                    }
                },
            }
        }
    }
}
