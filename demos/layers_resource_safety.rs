//! Layers and scopes: building a service environment whose teardown is
//! guaranteed, in reverse acquisition order, even on failure.
//!
//! Run with `cargo run --example layers_resource_safety`.

use millrace::prelude::*;
use millrace::{instrument, logger_layer, metrics_layer, service, tracer_layer, LayerError};

struct Database {
    url: String,
}

struct Cache {
    entries: usize,
}

fn database_layer() -> Layer {
    Layer::from_resource(
        |_ctx| async {
            println!("  opening database");
            Ok::<_, LayerError>(Database {
                url: "postgres://localhost/app".to_string(),
            })
        },
        |db| async move {
            println!("  closing database ({})", db.url);
        },
    )
}

fn cache_layer() -> Layer {
    Layer::from_resource(
        |_ctx| async {
            println!("  warming cache");
            Ok::<_, LayerError>(Cache { entries: 1024 })
        },
        |cache| async move {
            println!("  flushing cache ({} entries)", cache.entries);
        },
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let ctx = Context::new();

    // Sequential: the cache may depend on the database. Teardown runs
    // cache first, then database.
    println!("sequential build:");
    let program = service::<Database, String>()
        .zip(service::<Cache, String>())
        .map(|(db, cache)| format!("using {} with {} cached entries", db.url, cache.entries))
        .provide(database_layer() + cache_layer());
    println!("  {:?}", program.run(&ctx).await);

    // Parallel: observability services are independent; build them
    // concurrently and instrument an effect against the result.
    println!("parallel observability stack:");
    let observed = instrument(
        "demo.work",
        Effect::<i32, String>::succeed(7).map(|x| x * 6),
        &[("component", "demo")],
    )
    .provide(logger_layer() | metrics_layer() | tracer_layer());
    println!("  instrumented result: {:?}", observed.run(&ctx).await);

    // Scoped resources registered mid-effect release on scope close.
    println!("scoped acquire_release:");
    let scoped = Effect::<String, String>::scoped(|_scope| {
        Effect::acquire_release(
            Effect::sync(|| {
                println!("  acquired lease");
                "lease-17".to_string()
            }),
            |lease| async move {
                println!("  released {lease}");
            },
        )
        .map(|lease| format!("worked under {lease}"))
    });
    println!("  {:?}", scoped.run(&ctx).await);
}
