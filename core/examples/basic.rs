//! Basic policy composition example

use resilience_machines::{
    CircuitBreaker, Context, Error, Operation, Pipeline, RateLimiter, RateLimiterConfig, Retry,
    RetryConfig, Timeout,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::main]
async fn main() {
    println!("=== Resilience Pipeline Basic Example ===\n");

    let breaker = CircuitBreaker::builder("payment_api")
        .failure_threshold(3)
        .open_timeout(Duration::from_millis(200))
        .success_threshold(1)
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build();

    let pipeline: Pipeline<String, String> = Pipeline::new()
        .with(Retry::new(RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            ..Default::default()
        }))
        .with(breaker.clone())
        .with(RateLimiter::new(RateLimiterConfig {
            rate: 50.0,
            burst: 5,
        }))
        .with(Timeout::after(Duration::from_millis(100)));

    // Succeeds for the first two calls, fails for the next four, then recovers
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let payment = Operation::new(move |_ctx| {
        let n = calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if (3..=6).contains(&n) {
                Err(format!("payment gateway error #{}", n))
            } else {
                Ok(format!("payment {} accepted", n))
            }
        }
    });

    println!("Initial state: {}\n", breaker.state_name());

    for round in 1..=4 {
        match pipeline.execute(Context::background(), &payment).await {
            Ok(receipt) => println!("✓ round {}: {}", round, receipt),
            Err(Error::CircuitOpen) => println!("✗ round {}: rejected, circuit open", round),
            Err(e) => println!("✗ round {}: {}", round, e),
        }
        println!("  state: {}", breaker.state_name());
    }

    println!("\n--- Waiting for open timeout ---");
    tokio::time::sleep(Duration::from_millis(250)).await;

    match pipeline.execute(Context::background(), &payment).await {
        Ok(receipt) => println!("✓ trial call: {}", receipt),
        Err(e) => println!("✗ trial call: {}", e),
    }
    println!("State: {}", breaker.state_name());

    println!("\n--- Caller deadline ---");
    let slow = Operation::new(|_ctx| async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, String>("too late".to_string())
    });
    let ctx = Context::background().with_timeout(Duration::from_millis(20));
    match pipeline.execute(ctx, &slow).await {
        Ok(v) => println!("✓ {}", v),
        Err(e) => println!("✗ {}", e),
    }

    println!("\nOperation invoked {} times", calls.load(Ordering::SeqCst));
}
