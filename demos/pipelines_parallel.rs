//! A staged pipeline: bounded channels, per-stage worker pools, and a
//! lifecycle driver that closes the source to shut everything down.
//!
//! Run with `cargo run --example pipelines_parallel`.

use std::sync::Arc;
use std::time::Duration;

use millrace::prelude::*;
use millrace::{stage, Channel};

#[tokio::main]
async fn main() {
    let source = Arc::new(Channel::new(8));
    let sink = Arc::new(Channel::new(8));

    let pipeline = Pipeline::from_channel(source.clone())
        .via(stage(
            |x: u64| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                x + 1
            },
            2,
            4,
        ))
        .via(stage(
            |x: u64| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                x * x
            },
            3,
            4,
        ));

    let runtime = Runtime::new(Context::new());
    let running = runtime.fork_named(pipeline.to_channel(sink.clone()), "pipeline");

    let producer = {
        let source = source.clone();
        tokio::spawn(async move {
            for i in 0..12u64 {
                source.send(i).await.expect("pipeline accepts input");
            }
            // closing the source is the shutdown signal: workers drain
            // and exit, and the pipeline fiber completes
            source.close();
        })
    };

    let mut results = Vec::new();
    for _ in 0..12 {
        results.push(sink.receive().await.expect("pipeline produces output"));
    }
    producer.await.expect("producer finishes");

    let exit = running.await_().await;
    results.sort();
    println!("pipeline exit: {exit:?}");
    println!("squares of successors: {results:?}");
}
