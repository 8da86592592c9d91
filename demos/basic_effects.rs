//! Composing effects: construction, recovery, annotation, and retries.
//!
//! Run with `cargo run --example basic_effects`.

use std::time::Duration;

use millrace::prelude::*;
use millrace::Schedule;

#[tokio::main]
async fn main() {
    let ctx = Context::new();

    // Sequential composition on the success channel.
    let pipeline = Effect::<i32, String>::succeed(10)
        .map(|x| x * 2)
        .flat_map(|x| Effect::succeed(x + 3));
    println!("succeed/map/flat_map: {:?}", pipeline.run(&ctx).await);

    // Typed failures are values, recoverable with catch_all.
    let recovered = Effect::<String, String>::fail("boom".to_string())
        .catch_all(|e| Effect::<String, String>::succeed(format!("handled:{e}")));
    println!("catch_all: {:?}", recovered.run(&ctx).await);

    // Defects skip typed recovery and render as a cause tree.
    let doomed = Effect::<i32, String>::die("invariant broken")
        .annotate("while reconciling accounts")
        .catch_all(|_| Effect::<i32, String>::succeed(0));
    if let Exit::Failure(cause) = doomed.run(&ctx).await {
        println!("defect cause:\n{}", cause.render());
    }

    // Retries consult a schedule; delays go through the clock service.
    let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let flaky = move || {
        let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if n < 3 {
            Effect::<u32, String>::fail(format!("attempt {n}"))
        } else {
            Effect::succeed(n)
        }
    };
    let schedule = Schedule::exponential(Duration::from_millis(10)).up_to(Duration::from_secs(1));
    let retried = Effect::retry(flaky, schedule).provide(clock_layer());
    println!("retry: {:?}", retried.run(&ctx).await);
}
