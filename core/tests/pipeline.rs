use resilience_machines::{
    Backoff, CircuitBreaker, Context, Error, ManualClock, Operation, Pipeline, RateLimiter,
    RateLimiterConfig, Retry, RetryConfig, Timeout, execute,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn counted<F>(calls: &Arc<AtomicUsize>, script: F) -> Operation<u32, &'static str>
where
    F: Fn(usize) -> Result<u32, &'static str> + Send + Sync + 'static,
{
    let calls = Arc::clone(calls);
    Operation::new(move |_ctx| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let result = script(n);
        async move { result }
    })
}

fn quick_retry(max_attempts: usize) -> Retry {
    Retry::new(RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        backoff: Backoff::Fixed,
        jitter: false,
        ..Default::default()
    })
}

#[tokio::test]
async fn retry_outside_breaker_stops_at_open_circuit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |_| Err("down"));
    let retry = quick_retry(5);
    let breaker = CircuitBreaker::builder("orders").failure_threshold(2).build();

    let result = execute(Context::background(), &op, &[&retry, &breaker]).await;

    // Attempts 3..5 are rejected without reaching the operation
    assert_eq!(result, Err(Error::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(breaker.is_open());
}

#[tokio::test]
async fn breaker_outside_retry_counts_one_failure_per_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |_| Err("down"));
    let retry = quick_retry(3);
    let breaker = CircuitBreaker::builder("orders").failure_threshold(2).build();

    let first = execute(Context::background(), &op, &[&breaker, &retry]).await;
    assert_eq!(first, Err(Error::Operation("down")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.failure_count(), 1);
    assert!(breaker.is_closed());
}

#[tokio::test]
async fn retry_recovers_from_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |n| if n < 3 { Err("flaky") } else { Ok(7) });
    let pipeline: Pipeline<u32, &'static str> = Pipeline::new()
        .with(quick_retry(3))
        .with(CircuitBreaker::builder("flaky").failure_threshold(5).build());

    assert_eq!(pipeline.execute(Context::background(), &op).await, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn timeout_inside_retry_applies_per_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let op = Operation::new(move |_ctx| {
        let n = calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok::<_, &'static str>(n)
        }
    });

    let retry = quick_retry(2);
    let timeout = Timeout::after(Duration::from_millis(50));

    let result = execute(Context::background(), &op, &[&retry, &timeout]).await;

    assert_eq!(result, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_outside_retry_bounds_the_whole_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |_| Err("slow failure"));
    let retry = Retry::new(RetryConfig {
        max_attempts: 10,
        initial_delay: Duration::from_millis(40),
        backoff: Backoff::Fixed,
        jitter: false,
        ..Default::default()
    });
    let timeout = Timeout::after(Duration::from_millis(100));

    let result = execute(Context::background(), &op, &[&timeout, &retry]).await;

    assert_eq!(result, Err(Error::DeadlineExceeded));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limiter_outside_retry_spends_one_token_per_call() {
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(RateLimiterConfig { rate: 1.0, burst: 2 }, clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |n| if n % 3 == 0 { Ok(1) } else { Err("retry me") });
    let retry = quick_retry(3);

    assert_eq!(
        execute(Context::background(), &op, &[&limiter, &retry]).await,
        Ok(1)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.available_tokens(), 1.0);
}

#[tokio::test]
async fn rate_limit_rejections_are_retried_when_limiter_is_inside() {
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(RateLimiterConfig { rate: 1.0, burst: 1 }, clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |_| Err("fails"));
    let retry = quick_retry(3);

    let result = execute(Context::background(), &op, &[&retry, &limiter]).await;

    assert_eq!(result, Err(Error::RateLimitExceeded));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_retry_wait() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |_| Err("down"));
    let retry = Retry::new(RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_secs(60),
        backoff: Backoff::Fixed,
        jitter: false,
        ..Default::default()
    });

    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = execute(ctx, &op, &[&retry]).await;

    assert_eq!(result, Err(Error::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn empty_policy_list_calls_operation_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = counted(&calls, |_| Err("plain"));

    let result = execute(Context::background(), &op, &[]).await;

    assert_eq!(result, Err(Error::Operation("plain")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn breaker_state_is_shared_across_pipelines() {
    let breaker = CircuitBreaker::builder("shared").failure_threshold(1).build();
    let failing = counted(&Arc::new(AtomicUsize::new(0)), |_| Err("down"));
    let healthy_calls = Arc::new(AtomicUsize::new(0));
    let healthy = counted(&healthy_calls, |_| Ok(1));

    let first: Pipeline<u32, &'static str> = Pipeline::new().with(breaker.clone());
    let second: Pipeline<u32, &'static str> = Pipeline::new().with(breaker.clone());

    let _ = first.execute(Context::background(), &failing).await;
    assert_eq!(
        second.execute(Context::background(), &healthy).await,
        Err(Error::CircuitOpen)
    );
    assert_eq!(healthy_calls.load(Ordering::SeqCst), 0);
}
