//! Streams and sinks: staged flows, early termination, error
//! propagation, and per-worker resources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use millrace::{Channel, Context, Effect, Exit, Runtime, Sink, Stream};

fn ctx() -> Context {
    Context::new()
}

// ============================================================================
// sources and pure stages
// ============================================================================

#[tokio::test]
async fn from_iterable_collects_in_order() {
    let exit = Stream::<i32, String>::from_iterable(vec![1, 2, 3, 4])
        .run_collect()
        .run(&ctx())
        .await;
    assert_eq!(exit, Exit::Success(vec![1, 2, 3, 4]));
}

#[tokio::test]
async fn map_filter_take_compose() {
    let exit = Stream::<i32, String>::from_iterable(0..100)
        .map(|x| x * 2)
        .filter(|x| x % 3 == 0)
        .take(4)
        .run_collect()
        .run(&ctx())
        .await;
    assert_eq!(exit, Exit::Success(vec![0, 6, 12, 18]));
}

#[tokio::test]
async fn take_terminates_an_infinite_source_early() {
    let produced = Arc::new(AtomicUsize::new(0));
    let probe = produced.clone();

    let exit = Stream::<usize, String>::from_build(move |out, _errors| {
        Effect::from_run(move |_ctx| {
            Box::pin(async move {
                tokio::spawn(async move {
                    let mut n = 0;
                    loop {
                        probe.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        if out.send(n).await.is_err() {
                            return;
                        }
                        n += 1;
                    }
                });
                Exit::Success(())
            })
        })
    })
    .buffer(2)
    .take(5)
    .run_collect()
    .run(&ctx())
    .await;

    assert_eq!(exit, Exit::Success(vec![0, 1, 2, 3, 4]));

    // the close cascade reaches the producer: its counter stops moving
    tokio::time::sleep(Duration::from_millis(30)).await;
    let settled = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn run_fold_aggregates() {
    let exit = Stream::<i32, String>::from_iterable(1..=5)
        .run_fold(0, |acc, x| acc + x)
        .run(&ctx())
        .await;
    assert_eq!(exit, Exit::Success(15));
}

#[tokio::test]
async fn head_takes_the_first_item_and_stops() {
    let exit = Stream::<i32, String>::from_iterable(7..1_000_000)
        .run(Sink::head())
        .run(&ctx())
        .await;
    assert_eq!(exit, Exit::Success(Some(7)));

    let empty = Stream::<i32, String>::from_iterable(Vec::new())
        .run(Sink::head())
        .run(&ctx())
        .await;
    assert_eq!(empty, Exit::Success(None));
}

// ============================================================================
// effectful stages and errors
// ============================================================================

#[tokio::test]
async fn via_effect_runs_transforms_with_the_environment() {
    struct Multiplier {
        by: i32,
    }

    let environment = ctx().add(Multiplier { by: 10 });
    let exit = Stream::<i32, String>::from_iterable(vec![1, 2, 3])
        .via_effect(
            |x| {
                millrace::service::<Multiplier, String>().map(move |m| x * m.by)
            },
            2,
            4,
        )
        .run_collect()
        .run(&environment)
        .await;

    let mut values = exit.into_value().expect("stream succeeds");
    values.sort();
    assert_eq!(values, vec![10, 20, 30]);
}

#[tokio::test]
async fn a_failing_transform_fails_the_whole_flow() {
    let exit = Stream::<i32, String>::from_iterable(1..=100)
        .via_effect(
            |x| {
                if x == 3 {
                    Effect::fail("bad item".to_string())
                } else {
                    Effect::succeed(x)
                }
            },
            1,
            0,
        )
        .run(Sink::drain())
        .run(&ctx())
        .await;

    assert_eq!(exit, Exit::Failure(millrace::Cause::fail("bad item".to_string())));
}

#[tokio::test]
async fn a_panicking_predicate_is_a_defect() {
    let exit = Stream::<i32, String>::from_iterable(vec![1, 2, 3])
        .filter(|x| {
            if *x == 2 {
                panic!("predicate bug");
            }
            true
        })
        .run(Sink::drain())
        .run(&ctx())
        .await;
    assert!(matches!(&exit, Exit::Failure(cause) if cause.is_die()));
}

#[tokio::test]
async fn timeout_fails_a_stalled_flow() {
    let exit = Stream::<i32, String>::from_build(|out, _errors| {
        Effect::from_run(move |_ctx| {
            Box::pin(async move {
                tokio::spawn(async move {
                    let _ = out.send(1).await;
                    // stall without closing: only the stage timeout ends this
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    out.close();
                });
                Exit::Success(())
            })
        })
    })
    .timeout(Duration::from_millis(50), || "stream stalled".to_string())
    .run(Sink::drain())
    .run(&ctx())
    .await;

    assert_eq!(
        exit,
        Exit::Failure(millrace::Cause::fail("stream stalled".to_string()))
    );
}

#[tokio::test]
async fn throttle_spaces_out_emissions() {
    let started = std::time::Instant::now();
    let exit = Stream::<i32, String>::from_iterable(vec![1, 2, 3])
        .throttle(Duration::from_millis(20))
        .run_collect()
        .run(&ctx())
        .await;

    assert_eq!(exit, Exit::Success(vec![1, 2, 3]));
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "expected at least 3 throttle periods, got {:?}",
        started.elapsed()
    );
}

// ============================================================================
// merge and channel sources
// ============================================================================

#[tokio::test]
async fn merge_interleaves_both_inputs_completely() {
    let left = Stream::<i32, String>::from_iterable(vec![1, 3, 5]);
    let right = Stream::<i32, String>::from_iterable(vec![2, 4, 6]);

    let exit = left.merge(right).run_collect().run(&ctx()).await;
    let mut values = exit.into_value().expect("merge succeeds");
    values.sort();
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn from_channel_drains_a_closed_source() {
    let channel = Arc::new(Channel::new(8));
    for i in 1..=3 {
        channel.send(i).await.unwrap();
    }
    channel.close();

    let exit = Stream::<i32, String>::from_channel(channel)
        .run_collect()
        .run(&ctx())
        .await;
    assert_eq!(exit, Exit::Success(vec![1, 2, 3]));
}

// ============================================================================
// per-worker resources
// ============================================================================

#[tokio::test]
async fn via_acquire_release_pairs_acquires_with_releases() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let acquired = Arc::new(AtomicUsize::new(0));

    let acquire_log = acquired.clone();
    let release_log = log.clone();
    let exit = Stream::<i32, String>::from_iterable(vec![1, 2, 3, 4, 5, 6])
        .via_acquire_release(
            move || {
                let n = acquire_log.fetch_add(1, Ordering::SeqCst);
                Effect::succeed(format!("conn-{n}"))
            },
            move |conn| {
                let log = release_log.clone();
                Effect::sync(move || {
                    log.lock().unwrap().push(conn);
                })
            },
            |conn, x| Effect::succeed(format!("{conn}:{x}")),
            2,
            4,
        )
        .run_collect()
        .run(&ctx())
        .await;

    let values = exit.into_value().expect("stream succeeds");
    assert_eq!(values.len(), 6);

    // give the workers a beat to run their releases
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(acquired.load(Ordering::SeqCst), 2);
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn a_failed_acquire_fails_the_flow() {
    let exit = Stream::<i32, String>::from_iterable(vec![1, 2, 3])
        .via_acquire_release(
            || Effect::<String, String>::fail("no connection".to_string()),
            |_conn| Effect::succeed(()),
            |conn, x| Effect::succeed(format!("{conn}:{x}")),
            1,
            0,
        )
        .run(Sink::drain())
        .run(&ctx())
        .await;
    assert_eq!(
        exit,
        Exit::Failure(millrace::Cause::fail("no connection".to_string()))
    );
}

// ============================================================================
// interruption
// ============================================================================

#[tokio::test]
async fn interrupting_a_running_stream_stops_the_sink() {
    let runtime = Runtime::new(Context::new());
    let stalled = Stream::<i32, String>::from_build(|out, _errors| {
        Effect::from_run(move |_ctx| {
            Box::pin(async move {
                tokio::spawn(async move {
                    // produce nothing, never close: the consumer can only
                    // be freed by interruption
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    out.close();
                });
                Exit::Success(())
            })
        })
    });

    let fiber = runtime.fork(stalled.run(Sink::drain()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let exit = fiber.interrupt().await;
    assert!(exit.is_interrupted());
}
