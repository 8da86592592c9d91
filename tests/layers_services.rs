//! Layer composition, service resolution, and the observability stack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use millrace::{
    instrument, logger_layer, metrics_layer, service, tracer_layer, Context, Effect, Exit, Layer,
    LayerError, LogLevel, Logger, MemoryLogSink, MetricsRegistry, Scope, SpanStatus, Tracer,
};

fn record(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

struct ServiceA;
struct ServiceB;

fn tracked_layer<T: Send + Sync + 'static>(
    log: Arc<Mutex<Vec<String>>>,
    name: &'static str,
    make: fn() -> T,
) -> Layer {
    let make_log = log.clone();
    Layer::from_resource(
        move |_ctx| {
            let log = make_log.clone();
            async move {
                record(&log, &format!("mk_{name}"));
                Ok::<_, LayerError>(make())
            }
        },
        move |_service: Arc<T>| {
            let log = log.clone();
            async move {
                record(&log, &format!("close_{name}"));
            }
        },
    )
}

fn failing_layer() -> Layer {
    Layer::from_build(|_ctx, _scope| async { Err(LayerError::new("refused to build")) })
}

// ============================================================================
// build and teardown
// ============================================================================

#[tokio::test]
async fn from_resource_builds_and_tears_down() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let layer = tracked_layer(log.clone(), "a", || ServiceA);

    let scope = Arc::new(Scope::new());
    let ctx = layer.build_scoped(&Context::new(), &scope).await.unwrap();
    assert!(ctx.get::<ServiceA>().is_some());

    scope.close().await;
    assert_eq!(*log.lock().unwrap(), vec!["mk_a", "close_a"]);
}

#[tokio::test]
async fn provide_builds_runs_and_releases() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let layer = tracked_layer(log.clone(), "a", || ServiceA);

    let use_log = log.clone();
    let program = service::<ServiceA, String>()
        .map(move |_| {
            record(&use_log, "use");
            42
        })
        .provide(layer);

    assert_eq!(program.run(&Context::new()).await, Exit::Success(42));
    assert_eq!(*log.lock().unwrap(), vec!["mk_a", "use", "close_a"]);
}

#[tokio::test]
async fn sequential_composition_builds_left_then_right() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let layer = tracked_layer(log.clone(), "a", || ServiceA)
        + tracked_layer(log.clone(), "b", || ServiceB);

    let program = service::<ServiceA, String>()
        .zip(service::<ServiceB, String>())
        .map(|_| ())
        .provide(layer);
    assert!(program.run(&Context::new()).await.is_success());

    assert_eq!(
        *log.lock().unwrap(),
        vec!["mk_a", "mk_b", "close_b", "close_a"]
    );
}

#[tokio::test]
async fn right_side_of_sequential_sees_left_services() {
    let layer = Layer::from_value(7u32)
        + Layer::from_build(|ctx, _scope| async move {
            match ctx.get::<u32>() {
                Some(n) => Ok(ctx.add(format!("seen:{n}"))),
                None => Err(LayerError::new("left service missing")),
            }
        });

    let program = service::<String, String>().map(|s| (*s).clone()).provide(layer);
    assert_eq!(
        program.run(&Context::new()).await,
        Exit::Success("seen:7".to_string())
    );
}

#[tokio::test]
async fn a_failing_right_side_releases_the_left() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let layer = tracked_layer(log.clone(), "a", || ServiceA) + failing_layer();

    let scope = Arc::new(Scope::new());
    let built = layer.build_scoped(&Context::new(), &scope).await;
    assert!(built.is_err());
    assert_eq!(*log.lock().unwrap(), vec!["mk_a", "close_a"]);

    // the parent scope close must not release anything twice
    scope.close().await;
    assert_eq!(*log.lock().unwrap(), vec!["mk_a", "close_a"]);
}

#[tokio::test]
async fn parallel_composition_merges_and_releases_on_partial_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let merged = tracked_layer(log.clone(), "a", || ServiceA)
        | tracked_layer(log.clone(), "b", || ServiceB);
    let scope = Arc::new(Scope::new());
    let ctx = merged.build_scoped(&Context::new(), &scope).await.unwrap();
    assert!(ctx.get::<ServiceA>().is_some());
    assert!(ctx.get::<ServiceB>().is_some());
    scope.close().await;

    log.lock().unwrap().clear();
    let partial = tracked_layer(log.clone(), "a", || ServiceA) | failing_layer();
    let scope = Arc::new(Scope::new());
    assert!(partial.build_scoped(&Context::new(), &scope).await.is_err());
    assert!(
        log.lock().unwrap().contains(&"close_a".to_string()),
        "the surviving side must be released before the error propagates"
    );
}

#[tokio::test]
async fn parallel_conflicts_resolve_right_wins() {
    let layer = Layer::from_value(1u32) | Layer::from_value(2u32);
    let scope = Arc::new(Scope::new());
    let ctx = layer.build_scoped(&Context::new(), &scope).await.unwrap();
    assert_eq!(*ctx.get::<u32>().unwrap(), 2);
    scope.close().await;
}

#[tokio::test]
async fn provide_surfaces_build_failures_as_defects() {
    let program = Effect::<i32, String>::succeed(1).provide(failing_layer());
    let exit = program.run(&Context::new()).await;
    assert!(matches!(&exit, Exit::Failure(cause) if cause.is_die()));
}

// ============================================================================
// observability services
// ============================================================================

#[tokio::test]
async fn instrument_logs_measures_and_traces() {
    let sink = Arc::new(MemoryLogSink::new());
    let registry = Arc::new(MetricsRegistry::new());
    let tracer = Arc::new(Tracer::new());
    let ctx = Context::new()
        .add(Logger::new(sink.clone()))
        .add_shared(registry.clone())
        .add_shared(tracer.clone());

    let exit = instrument(
        "user.fetch",
        Effect::<i32, String>::succeed(9),
        &[("tenant", "t1")],
    )
    .run(&ctx)
    .await;
    assert_eq!(exit, Exit::Success(9));

    let messages: Vec<String> = sink.entries().into_iter().map(|e| e.message).collect();
    assert!(messages.iter().any(|m| m.contains("start user.fetch")));
    assert!(messages.iter().any(|m| m.contains("end user.fetch")));

    let histogram = registry.histogram(
        "effect_duration_seconds",
        &[("effect", "user.fetch"), ("tenant", "t1")],
    );
    assert_eq!(histogram.count(), 1);

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name(), "user.fetch");
    assert!(spans[0].is_ended());
    assert_eq!(spans[0].status(), SpanStatus::Ok);
}

#[tokio::test]
async fn instrument_marks_failures_on_the_span() {
    let tracer = Arc::new(Tracer::new());
    let sink = Arc::new(MemoryLogSink::new());
    let ctx = Context::new()
        .add(Logger::new(sink.clone()))
        .add_shared(tracer.clone());

    let exit = instrument(
        "user.save",
        Effect::<i32, String>::fail("db down".to_string()),
        &[],
    )
    .run(&ctx)
    .await;
    assert!(exit.is_failure());

    let spans = tracer.spans();
    assert_eq!(spans[0].status(), SpanStatus::Error);
    assert!(sink
        .entries()
        .iter()
        .any(|e| e.level == LogLevel::Error && e.message.contains("fail user.save")));
}

#[tokio::test]
async fn nested_instrumented_effects_link_their_spans() {
    let tracer = Arc::new(Tracer::new());
    let ctx = Context::new().add_shared(tracer.clone());

    let inner = instrument("inner", Effect::<i32, String>::succeed(1), &[]);
    let outer = instrument("outer", inner, &[]);
    assert!(outer.run(&ctx).await.is_success());

    let spans = tracer.spans();
    assert_eq!(spans.len(), 2);
    let outer_span = spans.iter().find(|s| s.name() == "outer").unwrap();
    let inner_span = spans.iter().find(|s| s.name() == "inner").unwrap();
    assert_eq!(inner_span.parent_id(), Some(outer_span.span_id()));
    assert_eq!(inner_span.trace_id(), outer_span.trace_id());
}

#[tokio::test]
async fn instrument_skips_absent_services() {
    let exit = instrument("bare", Effect::<i32, String>::succeed(5), &[])
        .run(&Context::new())
        .await;
    assert_eq!(exit, Exit::Success(5));
}

#[tokio::test]
async fn observability_layers_compose_in_parallel() {
    let layer = logger_layer() | metrics_layer() | tracer_layer();
    let program = service::<Logger, String>()
        .zip(service::<MetricsRegistry, String>())
        .zip(service::<Tracer, String>())
        .map(|_| ())
        .provide(layer);
    assert!(program.run(&Context::new()).await.is_success());
}
