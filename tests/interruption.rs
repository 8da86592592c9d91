//! Cooperative interruption: timeouts, masking, and fiber cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use millrace::{clock_layer, Context, Effect, Exit, FiberStatus, Runtime};

fn slow_success<T: Send + 'static>(value: T, delay: Duration) -> Effect<T, String> {
    Effect::from_future(move || async move {
        tokio::time::sleep(delay).await;
        Ok(value)
    })
}

// ============================================================================
// timeout
// ============================================================================

#[tokio::test]
async fn timeout_returns_none_and_interrupts_the_primary() {
    let finalized = Arc::new(AtomicBool::new(false));
    let probe = finalized.clone();

    let program = slow_success(42, Duration::from_millis(500))
        .ensuring(Effect::sync(move || {
            probe.store(true, Ordering::SeqCst);
        }))
        .timeout(Duration::from_millis(20))
        .provide(clock_layer());

    let started = Instant::now();
    let exit = program.run(&Context::new()).await;

    assert_eq!(exit, Exit::Success(None));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(
        finalized.load(Ordering::SeqCst),
        "the primary's finalizers must complete before timeout returns"
    );
}

#[tokio::test]
async fn timeout_passes_through_a_fast_result() {
    let program = slow_success(42, Duration::from_millis(10))
        .timeout(Duration::from_millis(500))
        .provide(clock_layer());
    assert_eq!(program.run(&Context::new()).await, Exit::Success(Some(42)));
}

#[tokio::test]
async fn timeout_surfaces_a_primary_failure() {
    let program = Effect::<i32, String>::from_future(|| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err("broken".to_string())
    })
    .timeout(Duration::from_millis(500))
    .provide(clock_layer());
    assert_eq!(program.run(&Context::new()).await, Exit::fail("broken".to_string()));
}

// ============================================================================
// fiber interruption
// ============================================================================

#[tokio::test]
async fn interrupting_a_fiber_runs_on_interrupt_cleanup() {
    let cleaned = Arc::new(AtomicBool::new(false));
    let probe = cleaned.clone();

    let runtime = Runtime::new(Context::new());
    let fiber = runtime.fork(
        slow_success(1, Duration::from_secs(5)).on_interrupt(Effect::sync(move || {
            probe.store(true, Ordering::SeqCst);
        })),
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let exit = fiber.interrupt().await;

    assert!(exit.is_interrupted());
    assert_eq!(fiber.status(), FiberStatus::Interrupted);
    assert!(cleaned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn interrupt_is_idempotent() {
    let runtime = Runtime::new(Context::new());
    let fiber = runtime.fork(slow_success(1, Duration::from_secs(5)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let first = fiber.interrupt().await;
    let second = fiber.interrupt().await;
    assert_eq!(first, second);
}

// ============================================================================
// uninterruptible regions
// ============================================================================

#[tokio::test]
async fn uninterruptible_region_completes_before_the_interrupt_lands() {
    let completed = Arc::new(AtomicBool::new(false));
    let probe = completed.clone();

    let region = Effect::<(), String>::from_future(move || async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        probe.store(true, Ordering::SeqCst);
        Ok(())
    })
    .uninterruptible();

    let runtime = Runtime::new(Context::new());
    let fiber = runtime.fork(region);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let exit = fiber.interrupt().await;

    assert!(exit.is_interrupted());
    assert!(
        completed.load(Ordering::SeqCst),
        "the masked region must run to completion"
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn mask_restore_reenables_interruption() {
    let prologue_ran = Arc::new(AtomicBool::new(false));
    let probe = prologue_ran.clone();

    let program = Effect::<i32, String>::uninterruptible_mask(move |restore| {
        Effect::<(), String>::sync(move || {
            probe.store(true, Ordering::SeqCst);
        })
        .flat_map(move |_| restore.restore(slow_success(1, Duration::from_secs(5))))
    });

    let runtime = Runtime::new(Context::new());
    let fiber = runtime.fork(program);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let exit = fiber.interrupt().await;

    assert!(exit.is_interrupted());
    assert!(prologue_ran.load(Ordering::SeqCst));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "restored region should observe the interrupt promptly, took {:?}",
        started.elapsed()
    );
}
