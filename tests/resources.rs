//! Resource safety: ensuring, bracket, scopes, and acquire_release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use millrace::{Context, Effect, Exit, Runtime, Scope};

fn ctx() -> Context {
    Context::new()
}

fn record(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

// ============================================================================
// ensuring
// ============================================================================

#[tokio::test]
async fn ensuring_runs_on_success_and_failure() {
    let runs = Arc::new(AtomicUsize::new(0));

    let probe = runs.clone();
    let ok = Effect::<i32, String>::succeed(1).ensuring(Effect::sync(move || {
        probe.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(ok.run(&ctx()).await, Exit::Success(1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let probe = runs.clone();
    let bad = Effect::<i32, String>::fail("kaboom".to_string()).ensuring(Effect::sync(move || {
        probe.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(bad.run(&ctx()).await.is_failure());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ensuring_defect_combines_with_the_primary_cause() {
    let exit = Effect::<i32, String>::fail("primary".to_string())
        .ensuring(Effect::sync(|| panic!("finalizer broke")))
        .run(&ctx())
        .await;
    let cause = exit.cause().expect("failure");
    assert!(cause.is_fail());
    assert!(cause.is_die());
    let rendered = cause.render();
    assert!(rendered.contains("Then:"), "unexpected cause:\n{rendered}");
}

// ============================================================================
// Scope ordering
// ============================================================================

#[tokio::test]
async fn finalizers_release_in_reverse_insertion_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::new();

    for name in ["A", "B", "C"] {
        let log = log.clone();
        scope
            .add_finalizer(move || async move {
                record(&log, name);
            })
            .await;
    }
    assert!(scope.close().await.is_success());
    assert_eq!(*log.lock().unwrap(), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn nested_scopes_close_children_first() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let parent = Arc::new(Scope::new());
    let child = Arc::new(Scope::new());

    {
        let log = log.clone();
        child
            .add_finalizer(move || async move {
                record(&log, "child");
            })
            .await;
    }
    {
        let log = log.clone();
        parent
            .add_finalizer(move || async move {
                record(&log, "parent");
            })
            .await;
    }
    {
        let child = child.clone();
        parent
            .add_finalizer(move || async move {
                let _ = child.close().await;
            })
            .await;
    }

    parent.close().await;
    assert_eq!(*log.lock().unwrap(), vec!["child", "parent"]);
}

// ============================================================================
// acquire_release and bracket
// ============================================================================

#[tokio::test]
async fn acquire_release_registers_on_the_nearest_scope() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let acquire_log = log.clone();
    let release_log = log.clone();
    let use_log = log.clone();
    let program = Effect::<i32, String>::scoped(move |_scope| {
        Effect::acquire_release(
            Effect::sync(move || {
                record(&acquire_log, "acquire");
                10
            }),
            move |resource| {
                let release_log = release_log.clone();
                async move {
                    record(&release_log, &format!("release:{resource}"));
                }
            },
        )
        .map(move |resource| {
            record(&use_log, "use");
            resource * 2
        })
    });

    assert_eq!(program.run(&ctx()).await, Exit::Success(20));
    assert_eq!(*log.lock().unwrap(), vec!["acquire", "use", "release:10"]);
}

#[tokio::test]
async fn acquire_release_outside_a_scope_is_a_defect() {
    let exit = Effect::<i32, String>::acquire_release(
        Effect::succeed(1),
        |_| async {},
    )
    .run(&ctx())
    .await;
    assert!(matches!(&exit, Exit::Failure(cause) if cause.is_die()));
}

#[tokio::test]
async fn failed_acquire_registers_no_release() {
    let released = Arc::new(AtomicUsize::new(0));
    let probe = released.clone();
    let program = Effect::<i32, String>::scoped(move |_scope| {
        Effect::acquire_release(Effect::fail("no resource".to_string()), move |_| {
            let probe = probe.clone();
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
            }
        })
    });

    assert!(program.run(&ctx()).await.is_failure());
    assert_eq!(released.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bracket_releases_on_use_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let acquire_log = log.clone();
    let release_log = log.clone();
    let exit = Effect::<i32, String>::bracket(
        Effect::sync(move || {
            record(&acquire_log, "acquire");
            7
        }),
        move |resource| {
            let release_log = release_log.clone();
            async move {
                record(&release_log, &format!("release:{resource}"));
            }
        },
        |_resource| Effect::<i32, String>::fail("use failed".to_string()),
    )
    .run(&ctx())
    .await;

    assert_eq!(exit, Exit::fail("use failed".to_string()));
    assert_eq!(*log.lock().unwrap(), vec!["acquire", "release:7"]);
}

#[tokio::test]
async fn bracket_returns_the_use_value() {
    let exit = Effect::<i32, String>::bracket(
        Effect::succeed(10),
        |_| async {},
        |resource| Effect::succeed(resource * 2),
    )
    .run(&ctx())
    .await;
    assert_eq!(exit, Exit::Success(20));
}

// ============================================================================
// run_scoped
// ============================================================================

#[tokio::test]
async fn run_scoped_closes_the_scope_afterward() {
    let released = Arc::new(AtomicUsize::new(0));
    let scope = Arc::new(Scope::new());
    {
        let probe = released.clone();
        scope
            .add_finalizer(move || async move {
                probe.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    let runtime = Runtime::new(Context::new());
    let exit = runtime
        .run_scoped(Effect::<i32, String>::succeed(5), scope.clone())
        .await;

    assert_eq!(exit, Exit::Success(5));
    assert!(scope.is_closed());
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn on_error_runs_only_on_failure() {
    let runs = Arc::new(AtomicUsize::new(0));

    let probe = runs.clone();
    let bad = Effect::<i32, String>::fail("boom".to_string()).on_error(move |_cause| {
        Effect::sync(move || {
            probe.fetch_add(1, Ordering::SeqCst);
        })
    });
    assert!(bad.run(&ctx()).await.is_failure());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let probe = runs.clone();
    let ok = Effect::<i32, String>::succeed(1).on_error(move |_cause| {
        Effect::sync(move || {
            probe.fetch_add(1, Ordering::SeqCst);
        })
    });
    assert_eq!(ok.run(&ctx()).await, Exit::Success(1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
