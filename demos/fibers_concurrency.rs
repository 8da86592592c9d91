//! Fibers, racing, timeouts, and cancellation on failure.
//!
//! Run with `cargo run --example fibers_concurrency`.

use std::time::Duration;

use millrace::prelude::*;

fn delayed<T: Send + 'static>(value: T, delay: Duration) -> Effect<T, String> {
    Effect::from_future(move || async move {
        tokio::time::sleep(delay).await;
        Ok(value)
    })
}

#[tokio::main]
async fn main() {
    let runtime = Runtime::new(Context::new());

    // Fork fibers, join them later.
    let fiber = runtime.fork_named(delayed("background result", Duration::from_millis(50)), "bg");
    println!("forked fiber {} ({:?})", fiber.id(), fiber.status());
    println!("joined: {:?}", fiber.join().await);

    // zip_par cancels the slow side as soon as the fast side fails.
    let exit = runtime
        .run(zip_par(
            delayed(1, Duration::from_secs(10)),
            delayed(2, Duration::from_millis(20))
                .flat_map(|_| Effect::<i32, String>::fail("fast side failed".to_string())),
        ))
        .await;
    println!("zip_par with a failing side: {:?}", exit);

    // race returns the first success and interrupts the loser.
    let winner = runtime
        .run(race(
            delayed("tortoise", Duration::from_millis(200)),
            delayed("hare", Duration::from_millis(20)),
        ))
        .await;
    println!("race winner: {:?}", winner);

    // timeout interrupts the primary and yields None when the clock wins.
    let timed_out = runtime
        .run(
            delayed(42, Duration::from_secs(10))
                .timeout(Duration::from_millis(30))
                .provide(clock_layer()),
        )
        .await;
    println!("timeout: {:?}", timed_out);

    // Bounded parallel map keeps input order.
    let mapped = runtime
        .run(for_each_par(
            (1..=8).collect::<Vec<i32>>(),
            |x| delayed(x * x, Duration::from_millis(10)),
            3,
        ))
        .await;
    println!("for_each_par: {:?}", mapped);
}
