//! Multi-stage pipelines: worker pools wired together with channels.
//!
//! A pipeline reads from a source [`Channel`], pushes items through an
//! ordered list of stages — each a pool of transformer fibers with its
//! own output capacity — and pumps results into a caller-supplied
//! output channel.
//!
//! The pipeline is plumbing, not lifecycle: a driver outside the
//! pipeline closes the *source* channel when production finishes.
//! Workers observe closed-and-empty input, drain it, and exit; the last
//! worker of a stage closes that stage's output so shutdown cascades
//! downstream. The effect returned by [`Pipeline::to_channel`] returns
//! only once every forked worker has reached a terminal state, and
//! interrupting it interrupts and awaits every worker first. The
//! caller's output channel is never closed by the pipeline.

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::cause::{Cause, Defect};
use crate::channel::Channel;
use crate::effect::{BoxFuture, Effect};
use crate::exit::Exit;
use crate::fiber::{FiberId, InterruptToken};

type Transform<A, B> = Arc<dyn Fn(A) -> BoxFuture<'static, B> + Send + Sync>;

/// One stage: a transformer replicated across `workers` fibers, writing
/// into a channel of `out_capacity`.
pub struct Stage<A, B> {
    transform: Transform<A, B>,
    workers: usize,
    out_capacity: usize,
}

impl<A, B> std::fmt::Debug for Stage<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("workers", &self.workers)
            .field("out_capacity", &self.out_capacity)
            .finish()
    }
}

/// Describe a stage running `f` on `workers` concurrent fibers.
pub fn stage<A, B, F, Fut>(f: F, workers: usize, out_capacity: usize) -> Stage<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = B> + Send + 'static,
{
    Stage {
        transform: Arc::new(move |item| Box::pin(f(item))),
        workers: workers.max(1),
        out_capacity,
    }
}

enum WorkerOutcome {
    Drained,
    Interrupted,
    Died(Defect),
}

#[derive(Default)]
struct PipelineWorkers {
    tokens: Vec<InterruptToken>,
    handles: Vec<JoinHandle<WorkerOutcome>>,
}

type Wire<In, Out> =
    Box<dyn FnOnce(Arc<Channel<In>>, &mut PipelineWorkers) -> Arc<Channel<Out>> + Send>;

/// A staged worker pipeline from a source channel.
///
/// Built with [`Pipeline::from_channel`], extended with
/// [`via`](Pipeline::via), and launched with
/// [`to_channel`](Pipeline::to_channel).
pub struct Pipeline<In, Out> {
    source: Arc<Channel<In>>,
    wire: Wire<In, Out>,
}

impl<In, Out> std::fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish()
    }
}

impl<In: Send + 'static> Pipeline<In, In> {
    /// A pipeline reading from `source`, initially with no stages.
    pub fn from_channel(source: Arc<Channel<In>>) -> Pipeline<In, In> {
        Pipeline {
            source,
            wire: Box::new(|source, _| source),
        }
    }
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Append a stage.
    pub fn via<Next: Send + 'static>(self, stage: Stage<Out, Next>) -> Pipeline<In, Next> {
        let upstream_wire = self.wire;
        Pipeline {
            source: self.source,
            wire: Box::new(move |source, workers| {
                let upstream = upstream_wire(source, workers);
                let downstream = Arc::new(Channel::new(stage.out_capacity));
                let remaining = Arc::new(AtomicUsize::new(stage.workers));
                for _ in 0..stage.workers {
                    let token = InterruptToken::new(Some(FiberId::next()));
                    let handle = tokio::spawn(stage_worker(
                        upstream.clone(),
                        downstream.clone(),
                        stage.transform.clone(),
                        Some(remaining.clone()),
                        token.clone(),
                    ));
                    workers.tokens.push(token);
                    workers.handles.push(handle);
                }
                downstream
            }),
        }
    }

    /// Launch the pipeline: fork every stage's workers plus a final
    /// pump into `out`, then wait for all of them to reach a terminal
    /// state. A transformer panic fails the pipeline with a defect
    /// after stopping the remaining workers.
    pub fn to_channel(self, out: Arc<Channel<Out>>) -> Effect<(), Infallible> {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let mut workers = PipelineWorkers::default();
                let last = (self.wire)(self.source.clone(), &mut workers);

                let pump_token = InterruptToken::new(Some(FiberId::next()));
                let identity: Transform<Out, Out> =
                    Arc::new(|item| Box::pin(async move { item }));
                let pump = tokio::spawn(stage_worker(
                    last,
                    out,
                    identity,
                    None,
                    pump_token.clone(),
                ));
                workers.tokens.push(pump_token);
                workers.handles.push(pump);

                let PipelineWorkers { tokens, handles } = workers;
                let mut pending: FuturesUnordered<JoinHandle<WorkerOutcome>> =
                    handles.into_iter().collect();
                let parent = ctx.interrupt_token().clone();
                let mut defect: Option<Defect> = None;
                let mut parent_interrupted = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = parent.cancelled(), if !parent_interrupted && defect.is_none() => {
                            parent_interrupted = true;
                            for token in &tokens {
                                token.request();
                            }
                        }
                        next = pending.next() => match next {
                            None => break,
                            Some(Ok(WorkerOutcome::Died(died))) => {
                                if defect.is_none() {
                                    defect = Some(died);
                                    for token in &tokens {
                                        token.request();
                                    }
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(join_error)) => {
                                if join_error.is_panic() && defect.is_none() {
                                    defect = Some(Defect::from_panic(join_error.into_panic()));
                                    for token in &tokens {
                                        token.request();
                                    }
                                }
                            }
                        }
                    }
                }

                if let Some(defect) = defect {
                    return Exit::Failure(Cause::Die(defect));
                }
                if parent_interrupted {
                    return Exit::Failure(parent.interrupt_cause());
                }
                Exit::Success(())
            })
        })
    }
}

/// One worker: receive, transform, forward, until the input is drained
/// or the worker is interrupted. The last worker of a stage closes the
/// stage's output channel; the pump (`remaining == None`) never closes
/// the caller's channel.
async fn stage_worker<A, B>(
    input: Arc<Channel<A>>,
    output: Arc<Channel<B>>,
    transform: Transform<A, B>,
    remaining: Option<Arc<AtomicUsize>>,
    token: InterruptToken,
) -> WorkerOutcome
where
    A: Send + 'static,
    B: Send + 'static,
{
    let outcome = 'run: loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break 'run WorkerOutcome::Interrupted,
            _ = input.closed() => loop {
                if token.is_requested() {
                    break 'run WorkerOutcome::Interrupted;
                }
                match input.try_receive() {
                    Some(item) => {
                        if let Err(stop) = process_item(&transform, item, &output, &token).await {
                            break 'run stop;
                        }
                    }
                    None => break 'run WorkerOutcome::Drained,
                }
            },
            received = input.receive() => match received {
                Ok(item) => {
                    if let Err(stop) = process_item(&transform, item, &output, &token).await {
                        break 'run stop;
                    }
                }
                Err(_) => break 'run WorkerOutcome::Drained,
            },
        }
    };
    if let Some(remaining) = remaining {
        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            output.close();
        }
    }
    outcome
}

async fn process_item<A, B>(
    transform: &Transform<A, B>,
    item: A,
    output: &Channel<B>,
    token: &InterruptToken,
) -> Result<(), WorkerOutcome>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let guarded = AssertUnwindSafe(transform(item)).catch_unwind();
    let produced = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(WorkerOutcome::Interrupted),
        produced = guarded => produced,
    };
    match produced {
        Ok(value) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(WorkerOutcome::Interrupted),
                sent = output.send(value) => match sent {
                    Ok(()) => Ok(()),
                    Err(_) => Err(WorkerOutcome::Drained),
                },
            }
        }
        Err(payload) => Err(WorkerOutcome::Died(Defect::from_panic(payload))),
    }
}
