use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use service_discovery::services::registry::RegistryError;
use service_discovery::services::retry::{Backoff, RetryPolicy};
use service_discovery::services::store::StoreError;

#[test]
fn test_backoff_schedules() {
    let fixed = Backoff::Fixed(Duration::from_millis(100));
    assert_eq!(fixed.delay(1), Duration::from_millis(100));
    assert_eq!(fixed.delay(7), Duration::from_millis(100));

    let linear = Backoff::Linear(Duration::from_millis(10));
    assert_eq!(linear.delay(1), Duration::from_millis(10));
    assert_eq!(linear.delay(3), Duration::from_millis(30));

    let exponential = Backoff::Exponential {
        base: Duration::from_millis(100),
        max: Duration::from_secs(1),
    };
    assert_eq!(exponential.delay(1), Duration::from_millis(100));
    assert_eq!(exponential.delay(3), Duration::from_millis(400));
    assert_eq!(exponential.delay(5), Duration::from_secs(1));
    assert_eq!(exponential.delay(64), Duration::from_secs(1));
}

#[test]
fn test_total_delay_skips_last_attempt() {
    let policy = RetryPolicy::linear(4, Duration::from_millis(10));
    // 10 + 20 + 30
    assert_eq!(policy.total_delay(), Duration::from_millis(60));

    assert_eq!(RetryPolicy::fixed(0, Duration::from_secs(1)).max_attempts(), 1);
    assert_eq!(RetryPolicy::fixed(0, Duration::from_secs(1)).total_delay(), Duration::ZERO);
}

#[tokio::test]
async fn test_succeeds_after_empty_attempts() {
    let policy = RetryPolicy::fixed(5, Duration::from_millis(5));
    let calls = AtomicU32::new(0);

    let result = policy
        .run(|attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Ok(None)
                } else {
                    Ok(Some(attempt))
                }
            }
        })
        .await
        .expect("run failed");

    assert_eq!(result, Some(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhaustion_yields_none() {
    let policy = RetryPolicy::linear(4, Duration::from_millis(5));
    let calls = AtomicU32::new(0);

    let started = Instant::now();
    let result = policy
        .run(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<Option<()>, RegistryError>(None) }
        })
        .await
        .expect("run failed");

    assert!(result.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= policy.total_delay());
}

#[tokio::test]
async fn test_transient_error_retried_then_surfaced() {
    let policy = RetryPolicy::fixed(3, Duration::from_millis(5));
    let calls = AtomicU32::new(0);

    let err = policy
        .run(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<Option<()>, _>(RegistryError::from(StoreError::Unavailable(
                    "connection refused".to_string(),
                )))
            }
        })
        .await
        .expect_err("exhausted transient failures must surface");

    assert!(matches!(err, RegistryError::StoreUnavailable(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_transient_error_then_success() {
    let policy = RetryPolicy::fixed(3, Duration::from_millis(5));

    let result = policy
        .run(|attempt| async move {
            if attempt == 1 {
                Err(RegistryError::from(StoreError::Unavailable("blip".to_string())))
            } else {
                Ok(Some("ok"))
            }
        })
        .await
        .expect("second attempt should succeed");
    assert_eq!(result, Some("ok"));
}

#[tokio::test]
async fn test_permanent_error_not_retried() {
    let policy = RetryPolicy::fixed(5, Duration::from_millis(5));
    let calls = AtomicU32::new(0);

    let err = policy
        .run(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<Option<()>, _>(RegistryError::InvalidName("a/b".to_string())) }
        })
        .await
        .expect_err("permanent error must surface");

    assert!(matches!(err, RegistryError::InvalidName(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_each_run_starts_fresh() {
    let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
    let first_attempts = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        first_attempts.store(0, Ordering::SeqCst);
        let seen = first_attempts.clone();
        let _ = policy
            .run(|attempt| {
                if attempt == 1 {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                async { Ok::<Option<()>, RegistryError>(None) }
            })
            .await;
        assert_eq!(first_attempts.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let policy = RetryPolicy::fixed(10, Duration::from_secs(5));
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = timeout(
        Duration::from_secs(1),
        policy.run_until_cancelled(&token, |_| async { Ok::<Option<()>, RegistryError>(None) }),
    )
    .await
    .expect("cancellation did not interrupt the backoff sleep");

    assert!(matches!(result, Err(RegistryError::Cancelled)));
}

#[tokio::test]
async fn test_already_cancelled_token_skips_attempts() {
    let policy = RetryPolicy::fixed(3, Duration::from_millis(5));
    let token = CancellationToken::new();
    token.cancel();
    let calls = AtomicU32::new(0);

    let result = policy
        .run_until_cancelled(&token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(())) }
        })
        .await;

    assert!(matches!(result, Err(RegistryError::Cancelled)));
    assert!(calls.load(Ordering::SeqCst) <= 1);
}
