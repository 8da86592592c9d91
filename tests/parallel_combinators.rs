//! Parallel combinators: cancellation on failure, racing, bounded
//! concurrency.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use millrace::{for_each_par, merge_all, race, race_first, zip_par};
use millrace::{Cause, Context, Effect, Exit};

fn ctx() -> Context {
    Context::new()
}

/// An effect that succeeds with `value` after `delay`.
fn delayed_success<T: Send + 'static>(value: T, delay: Duration) -> Effect<T, String> {
    Effect::from_future(move || async move {
        tokio::time::sleep(delay).await;
        Ok(value)
    })
}

/// An effect that fails with `error` after `delay`.
fn delayed_failure<T: Send + 'static>(error: &str, delay: Duration) -> Effect<T, String> {
    let error = error.to_string();
    Effect::from_future(move || async move {
        tokio::time::sleep(delay).await;
        Err(error)
    })
}

// ============================================================================
// zip_par
// ============================================================================

#[tokio::test]
async fn zip_par_pairs_successes() {
    let exit = zip_par(
        delayed_success(1, Duration::from_millis(20)),
        delayed_success(2, Duration::from_millis(30)),
    )
    .run(&ctx())
    .await;
    assert_eq!(exit, Exit::Success((1, 2)));
}

#[tokio::test]
async fn zip_par_runs_both_sides_concurrently() {
    let delay = Duration::from_millis(60);
    let started = Instant::now();
    let exit = zip_par(delayed_success(1, delay), delayed_success(2, delay))
        .run(&ctx())
        .await;
    assert!(exit.is_success());
    assert!(
        started.elapsed() < Duration::from_millis(110),
        "expected concurrent execution, got {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn first_failure_interrupts_the_sibling() {
    let sibling_finalized = Arc::new(AtomicBool::new(false));
    let probe = sibling_finalized.clone();

    let slow = delayed_success(1, Duration::from_millis(500)).ensuring(Effect::sync(move || {
        probe.store(true, Ordering::SeqCst);
    }));
    let fast = delayed_failure::<i32>("x", Duration::from_millis(10));

    let started = Instant::now();
    let exit = zip_par(slow, fast).run(&ctx()).await;
    let elapsed = started.elapsed();

    assert_eq!(exit, Exit::Failure(Cause::fail("x".to_string())));
    assert!(
        elapsed < Duration::from_millis(200),
        "sibling was not cancelled promptly: {elapsed:?}"
    );
    assert!(
        sibling_finalized.load(Ordering::SeqCst),
        "the loser's finalizers must complete before zip_par returns"
    );
}

#[tokio::test]
async fn simultaneous_independent_failures_combine_with_both() {
    let exit = zip_par(
        delayed_failure::<i32>("left", Duration::from_millis(10)),
        delayed_failure::<i32>("right", Duration::from_millis(10)),
    )
    .run(&ctx())
    .await;

    let cause = exit.cause().expect("failure");
    let failures: Vec<&String> = cause.failures();
    assert!(!failures.is_empty());
    assert!(failures
        .iter()
        .all(|e| e.as_str() == "left" || e.as_str() == "right"));
}

// ============================================================================
// race
// ============================================================================

#[tokio::test]
async fn race_returns_the_first_success_and_interrupts_the_loser() {
    let loser_finalized = Arc::new(AtomicBool::new(false));
    let probe = loser_finalized.clone();

    let fast = delayed_success("fast", Duration::from_millis(10));
    let slow = delayed_success("slow", Duration::from_millis(500)).ensuring(Effect::sync(
        move || {
            probe.store(true, Ordering::SeqCst);
        },
    ));

    let started = Instant::now();
    let exit = race(fast, slow).run(&ctx()).await;

    assert_eq!(exit, Exit::Success("fast"));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(loser_finalized.load(Ordering::SeqCst));
}

#[tokio::test]
async fn race_waits_out_an_early_failure() {
    let exit = race(
        delayed_failure::<&str>("early", Duration::from_millis(10)),
        delayed_success("late", Duration::from_millis(60)),
    )
    .run(&ctx())
    .await;
    assert_eq!(exit, Exit::Success("late"));
}

#[tokio::test]
async fn race_combines_two_failures_with_both() {
    let exit = race(
        delayed_failure::<i32>("first", Duration::from_millis(10)),
        delayed_failure::<i32>("second", Duration::from_millis(20)),
    )
    .run(&ctx())
    .await;

    let cause = exit.cause().expect("failure");
    assert!(matches!(cause, Cause::Both(_, _)));
    let failures: Vec<String> = cause.failures().into_iter().cloned().collect();
    assert!(failures.contains(&"first".to_string()));
    assert!(failures.contains(&"second".to_string()));
}

// ============================================================================
// race_first / race_all
// ============================================================================

#[tokio::test]
async fn race_first_returns_the_first_completion_even_a_failure() {
    let started = Instant::now();
    let exit = race_first(vec![
        delayed_failure::<i32>("lost quickly", Duration::from_millis(10)),
        delayed_success(1, Duration::from_millis(500)),
        delayed_success(2, Duration::from_millis(500)),
    ])
    .run(&ctx())
    .await;

    assert_eq!(exit, Exit::Failure(Cause::fail("lost quickly".to_string())));
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn race_first_over_empty_input_is_a_defect() {
    let exit = race_first(Vec::<Effect<i32, String>>::new()).run(&ctx()).await;
    assert!(matches!(&exit, Exit::Failure(cause) if cause.is_die()));
}

// ============================================================================
// merge_all / for_each_par
// ============================================================================

#[tokio::test]
async fn merge_all_preserves_input_order() {
    let effects = vec![
        delayed_success(1, Duration::from_millis(40)),
        delayed_success(2, Duration::from_millis(5)),
        delayed_success(3, Duration::from_millis(20)),
    ];
    let exit = merge_all(effects, 3).run(&ctx()).await;
    assert_eq!(exit, Exit::Success(vec![1, 2, 3]));
}

#[tokio::test]
async fn merge_all_respects_the_concurrency_bound() {
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let effects: Vec<Effect<usize, String>> = (0..6)
        .map(|i| {
            let live = live.clone();
            let peak = peak.clone();
            Effect::from_future(move || async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            })
        })
        .collect();

    let exit = merge_all(effects, 2).run(&ctx()).await;
    assert_eq!(exit, Exit::Success(vec![0, 1, 2, 3, 4, 5]));
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "expected at most 2 concurrent effects, saw {}",
        peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn merge_all_failure_cancels_pending_work() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut effects: Vec<Effect<i32, String>> =
        vec![delayed_failure("stop", Duration::from_millis(10))];
    for i in 0..5 {
        let runs = runs.clone();
        effects.push(Effect::from_future(move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(i)
        }));
    }

    let started = Instant::now();
    let exit = merge_all(effects, 2).run(&ctx()).await;

    assert_eq!(exit, Exit::Failure(Cause::fail("stop".to_string())));
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "pending work was not cancelled: {:?}",
        started.elapsed()
    );
    assert!(runs.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn merge_all_over_empty_input_is_a_defect() {
    let exit = merge_all(Vec::<Effect<i32, String>>::new(), 2).run(&ctx()).await;
    assert!(matches!(&exit, Exit::Failure(cause) if cause.is_die()));
}

#[tokio::test]
async fn zero_parallelism_is_a_defect() {
    let exit = merge_all(vec![delayed_success(1, Duration::ZERO)], 0)
        .run(&ctx())
        .await;
    assert!(matches!(&exit, Exit::Failure(cause) if cause.is_die()));
}

#[tokio::test]
async fn for_each_par_maps_in_input_order() {
    let exit = for_each_par(
        (0..5).collect::<Vec<i32>>(),
        |x| delayed_success(x * 2, Duration::from_millis(5)),
        2,
    )
    .run(&ctx())
    .await;
    assert_eq!(exit, Exit::Success(vec![0, 2, 4, 6, 8]));
}

#[tokio::test]
async fn oversized_parallelism_behaves_as_unbounded() {
    let delay = Duration::from_millis(40);
    let effects: Vec<Effect<i32, String>> =
        (0..4).map(|i| delayed_success(i, delay)).collect();

    let started = Instant::now();
    let exit = merge_all(effects, 64).run(&ctx()).await;

    assert_eq!(exit, Exit::Success(vec![0, 1, 2, 3]));
    assert!(
        started.elapsed() < Duration::from_millis(110),
        "expected unbounded concurrency, got {:?}",
        started.elapsed()
    );
}
