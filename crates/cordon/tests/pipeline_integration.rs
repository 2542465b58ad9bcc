//! Integration tests for composed resilience pipelines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cordon::{
    BackoffPolicy, BulkheadConfig, CircuitBreakerConfig, CircuitBreakerStrategy, CircuitState,
    MockClock, PipelineError, ResiliencePipeline, RetryConfig,
};
use cordon::outcome::classifiers::PredicateClassifier;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("{message}")]
struct DownstreamError {
    message: &'static str,
}

fn transient() -> DownstreamError {
    DownstreamError { message: "transient" }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("debug").try_init();
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff: BackoffPolicy::Constant { delay: Duration::from_millis(1) },
    }
}

#[tokio::test]
async fn retry_succeeds_on_final_attempt_with_exact_invocation_count() {
    // Fails N-1 times then succeeds; with max_attempts = N the pipeline
    // returns the success after exactly N invocations.
    for n in 1..=5u32 {
        let pipeline: ResiliencePipeline<u32, DownstreamError> = ResiliencePipeline::builder()
            .retry(fast_retry(n))
            .build()
            .expect("valid pipeline");

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = pipeline
            .execute(
                &move |_ctx, _cancel| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < n - 1 {
                            Err(transient())
                        } else {
                            Ok(n)
                        }
                    }
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.expect("last attempt succeeds"), n);
        assert_eq!(calls.load(Ordering::SeqCst), n, "exactly {n} invocations");
    }
}

#[tokio::test]
async fn unhandled_fault_is_invoked_exactly_once() {
    let pipeline: ResiliencePipeline<u32, DownstreamError> = ResiliencePipeline::builder()
        .classifier(PredicateClassifier::new(|e: &DownstreamError| e.message == "transient"))
        .retry(fast_retry(10))
        .build()
        .expect("valid pipeline");

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let result = pipeline
        .execute(
            &move |_ctx, _cancel| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(DownstreamError { message: "schema violation" })
                }
            },
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(PipelineError::Unhandled { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn circuit_opens_at_ratio_threshold_and_rejects_without_invoking() {
    let config = CircuitBreakerConfig {
        failure_ratio_threshold: 0.5,
        minimum_sample_count: 10,
        sampling_duration: Duration::from_secs(60),
        break_duration: Duration::from_secs(5),
        half_open_trial_count: 1,
        serialized_trials: true,
    };
    let strategy =
        Arc::new(CircuitBreakerStrategy::with_clock(config, MockClock::new()).expect("valid"));
    let pipeline: ResiliencePipeline<u32, DownstreamError> = ResiliencePipeline::builder()
        .isolation_key("inventory")
        .strategy(strategy.clone())
        .build()
        .expect("valid pipeline");

    // 10 calls: 4 succeed, then 6 fail. Ratio hits 0.6 on the tenth sample.
    for i in 0..10u32 {
        let _ = pipeline
            .execute(
                &move |_ctx, _cancel| async move {
                    if i < 4 {
                        Ok(i)
                    } else {
                        Err(transient())
                    }
                },
                CancellationToken::new(),
            )
            .await;
    }
    assert_eq!(strategy.state_for("inventory"), Some(CircuitState::Open));

    // The 11th call is rejected fail-fast; the operation never runs.
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let result = pipeline
        .execute(
            &move |_ctx, _cancel| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                }
            },
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn half_open_trial_drives_close_or_reopen() {
    let config = CircuitBreakerConfig {
        failure_ratio_threshold: 0.5,
        minimum_sample_count: 4,
        sampling_duration: Duration::from_secs(60),
        break_duration: Duration::from_secs(5),
        half_open_trial_count: 1,
        serialized_trials: true,
    };
    let clock = MockClock::new();
    let strategy =
        Arc::new(CircuitBreakerStrategy::with_clock(config, clock.clone()).expect("valid"));
    let pipeline: ResiliencePipeline<u32, DownstreamError> = ResiliencePipeline::builder()
        .isolation_key("ledger")
        .strategy(strategy.clone())
        .build()
        .expect("valid pipeline");

    let trip = || async {
        for _ in 0..4 {
            let _ = pipeline
                .execute(
                    &|_ctx, _cancel| async move { Err::<u32, _>(transient()) },
                    CancellationToken::new(),
                )
                .await;
        }
    };

    trip().await;
    assert_eq!(strategy.state_for("ledger"), Some(CircuitState::Open));

    // A failing trial reopens.
    clock.advance(Duration::from_secs(5));
    let result = pipeline
        .execute(
            &|_ctx, _cancel| async move { Err::<u32, _>(transient()) },
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(PipelineError::Handled { .. })));
    assert_eq!(strategy.state_for("ledger"), Some(CircuitState::Open));

    // A succeeding trial closes.
    clock.advance(Duration::from_secs(5));
    let result = pipeline
        .execute(&|_ctx, _cancel| async move { Ok(1) }, CancellationToken::new())
        .await;
    assert_eq!(result.expect("trial succeeds"), 1);
    assert_eq!(strategy.state_for("ledger"), Some(CircuitState::Closed));
}

#[tokio::test(start_paused = true)]
async fn bulkhead_rejects_third_concurrent_call_then_readmits() {
    let pipeline: Arc<ResiliencePipeline<u32, DownstreamError>> = Arc::new(
        ResiliencePipeline::builder()
            .bulkhead(BulkheadConfig { max_concurrency: 2, max_queue_depth: 0 })
            .build()
            .expect("valid pipeline"),
    );

    let mut holders = Vec::new();
    for i in 0..2u32 {
        let pipeline = Arc::clone(&pipeline);
        holders.push(tokio::spawn(async move {
            pipeline
                .execute(
                    &move |_ctx, _cancel| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(i)
                    },
                    CancellationToken::new(),
                )
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let rejected = pipeline
        .execute(&|_ctx, _cancel| async move { Ok(9) }, CancellationToken::new())
        .await;
    assert!(matches!(rejected, Err(PipelineError::BulkheadRejected { max_concurrency: 2 })));

    for holder in holders {
        assert!(holder.await.expect("task").is_ok());
    }

    // Slots freed; a new call is admitted.
    let admitted = pipeline
        .execute(&|_ctx, _cancel| async move { Ok(9) }, CancellationToken::new())
        .await;
    assert_eq!(admitted.expect("admitted after release"), 9);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_backoff_returns_cancelled_not_stale_failure() {
    let pipeline: Arc<ResiliencePipeline<u32, DownstreamError>> = Arc::new(
        ResiliencePipeline::builder()
            .retry(RetryConfig {
                max_attempts: 5,
                backoff: BackoffPolicy::Constant { delay: Duration::from_secs(60) },
            })
            .build()
            .expect("valid pipeline"),
    );

    let token = CancellationToken::new();
    let cancel = token.clone();
    let handle = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move {
            pipeline
                .execute(
                    &|_ctx, _cancel| async move { Err::<u32, _>(transient()) },
                    token,
                )
                .await
        }
    });

    // First attempt fails, the pipeline enters its backoff sleep.
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let result = handle.await.expect("task");
    assert!(
        matches!(result, Err(PipelineError::Cancelled)),
        "expected Cancelled, got {result:?}"
    );
}

#[tokio::test]
async fn fallback_path_is_idempotent() {
    let pipeline: ResiliencePipeline<u32, DownstreamError> = ResiliencePipeline::builder()
        .fallback(|_| true, |_| 404)
        .retry(fast_retry(2))
        .build()
        .expect("valid pipeline");

    for _ in 0..2 {
        let result = pipeline
            .execute(
                &|_ctx, _cancel| async move { Err::<u32, _>(transient()) },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.expect("fallback substitutes"), 404);
    }
}

#[tokio::test(start_paused = true)]
async fn full_stack_composition_recovers_from_transient_failures() {
    init_tracing();
    // Outermost to innermost: fallback, bulkhead, total timeout, retry,
    // per-attempt timeout.
    let pipeline: ResiliencePipeline<&'static str, DownstreamError> =
        ResiliencePipeline::builder()
            .isolation_key("orders")
            .fallback(
                |error| matches!(error, PipelineError::RetriesExhausted { .. }),
                |_| "degraded",
            )
            .bulkhead(BulkheadConfig { max_concurrency: 8, max_queue_depth: 4 })
            .total_timeout(Duration::from_secs(30))
            .retry(fast_retry(4))
            .attempt_timeout(Duration::from_secs(1))
            .build()
            .expect("valid pipeline");

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let result = pipeline
        .execute(
            &move |_ctx, _cancel| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("live")
                    }
                }
            },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(result.expect("recovers"), "live");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Permanently failing operation lands on the fallback instead.
    let result = pipeline
        .execute(
            &|_ctx, _cancel| async move { Err::<&'static str, _>(transient()) },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(result.expect("fallback"), "degraded");
}

#[tokio::test]
async fn attempt_index_is_visible_to_the_operation() {
    let pipeline: ResiliencePipeline<u32, DownstreamError> = ResiliencePipeline::builder()
        .retry(fast_retry(4))
        .build()
        .expect("valid pipeline");

    let result = pipeline
        .execute(
            &|ctx: cordon::AttemptContext, _cancel| async move {
                if ctx.attempt() < 3 {
                    Err(transient())
                } else {
                    Ok(ctx.attempt())
                }
            },
            CancellationToken::new(),
        )
        .await;

    assert_eq!(result.expect("succeeds on attempt 3"), 3);
}
