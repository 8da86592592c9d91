//! Automatic observability for effects: logs, a duration histogram, and
//! a trace span around any wrapped effect, using whichever of the three
//! services the environment provides.

use std::time::Instant;

use crate::effect::Effect;
use crate::exit::Exit;
use crate::logger::Logger;
use crate::metrics::MetricsRegistry;
use crate::tracer::{SpanStatus, Tracer};

/// Wrap `eff` with logging, metrics, and tracing.
///
/// Absent services are skipped silently, so the wrapper is safe to use
/// in environments wired with any subset of
/// [`logger_layer`](crate::logger_layer),
/// [`metrics_layer`](crate::metrics_layer), and
/// [`tracer_layer`](crate::tracer_layer). The duration lands in the
/// `effect_duration_seconds` histogram labeled with `name` and `tags`;
/// nested instrumented effects link their spans through a fiber-local.
pub fn instrument<A, E>(name: &str, eff: Effect<A, E>, tags: &[(&str, &str)]) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + std::fmt::Debug + 'static,
{
    let name = name.to_string();
    let tags: Vec<(String, String)> = tags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Effect::from_run(move |ctx| {
        Box::pin(async move {
            let logger = ctx.get::<Logger>();
            let metrics = ctx.get::<MetricsRegistry>();
            let tracer = ctx.get::<Tracer>();
            let tag_refs: Vec<(&str, &str)> =
                tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

            let span = tracer.as_ref().map(|tracer| {
                let parent = tracer.current_slot().get_value(&ctx);
                let span = tracer.start_span_child(&name, &tag_refs, parent);
                tracer
                    .current_slot()
                    .set_value(&ctx, Some((span.trace_id(), span.span_id())));
                (span, parent)
            });

            if let Some(logger) = &logger {
                logger.log(crate::logger::LogLevel::Info, &format!("start {name}"), &tag_refs);
            }

            let started = Instant::now();
            let exit = eff.run_caught(ctx.clone()).await;
            let elapsed = started.elapsed();

            match &exit {
                Exit::Success(_) => {
                    if let Some((span, _)) = &span {
                        span.end();
                    }
                }
                Exit::Failure(cause) => {
                    let (status, rendered) = if cause.is_fail() {
                        (SpanStatus::Error, cause.render())
                    } else {
                        (SpanStatus::Die, cause.render())
                    };
                    if let Some(logger) = &logger {
                        let verb = if cause.is_fail() { "fail" } else { "die" };
                        logger.error(&format!("{verb} {name}: {}", rendered.trim_end()));
                    }
                    if let Some((span, _)) = &span {
                        span.end_with(status, Some(rendered));
                    }
                }
            }

            if let Some(metrics) = &metrics {
                let mut labels: Vec<(&str, &str)> = vec![("effect", name.as_str())];
                labels.extend(tag_refs.iter().copied());
                metrics
                    .histogram("effect_duration_seconds", &labels)
                    .observe(elapsed.as_secs_f64());
            }

            if let (Some(tracer), Some((_, parent))) = (&tracer, &span) {
                tracer.current_slot().set_value(&ctx, *parent);
            }

            if let Some(logger) = &logger {
                logger.info(&format!("end {name}"));
            }

            exit
        })
    })
}
