//! The tracer service: spans with events and parent linkage carried on
//! a fiber-local, so nested instrumented effects form a tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::fiber_local::FiberLocal;
use crate::layer::Layer;

/// How a span ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    /// Completed normally.
    Ok,
    /// Ended with a typed failure.
    Error,
    /// Ended with a defect or interruption.
    Die,
}

/// A timestamped event recorded on a span.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    /// The event's name.
    pub name: String,
    /// The event's attributes.
    pub attrs: Vec<(String, String)>,
    /// When the event was recorded.
    pub at: Instant,
}

struct SpanState {
    end: Option<Instant>,
    status: SpanStatus,
    error: Option<String>,
    events: Vec<SpanEvent>,
}

/// One unit of traced work.
pub struct Span {
    trace_id: u64,
    span_id: u64,
    parent_id: Option<u64>,
    name: String,
    attrs: Vec<(String, String)>,
    start: Instant,
    state: Mutex<SpanState>,
}

impl Span {
    /// The trace this span belongs to.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// This span's identifier.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// The enclosing span, if any.
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// The span's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attributes given at start.
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// When the span started.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Record a timestamped event.
    pub fn add_event(&self, name: &str, attrs: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events.push(SpanEvent {
            name: name.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            at: Instant::now(),
        });
    }

    /// End the span with OK status. Idempotent.
    pub fn end(&self) {
        self.end_with(SpanStatus::Ok, None);
    }

    /// End the span with an explicit status. Idempotent: the first end
    /// wins.
    pub fn end_with(&self, status: SpanStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.end.is_none() {
            state.end = Some(Instant::now());
            state.status = status;
            state.error = error;
        }
    }

    /// True once the span has ended.
    pub fn is_ended(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .end
            .is_some()
    }

    /// The span's final status; `Ok` while still open.
    pub fn status(&self) -> SpanStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    /// The error recorded at end, if any.
    pub fn error(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<SpanEvent> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .clone()
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name)
            .field("trace_id", &self.trace_id)
            .field("span_id", &self.span_id)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}

/// The tracer service: starts spans and retains them for inspection.
pub struct Tracer {
    spans: Mutex<Vec<Arc<Span>>>,
    next_id: AtomicU64,
    current: FiberLocal<Option<(u64, u64)>>,
}

impl Tracer {
    /// An empty tracer.
    pub fn new() -> Self {
        Tracer {
            spans: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            current: FiberLocal::new(None),
        }
    }

    /// Start a root span.
    pub fn start_span(&self, name: &str, attrs: &[(&str, &str)]) -> Arc<Span> {
        self.start_span_child(name, attrs, None)
    }

    /// Start a span under an explicit parent `(trace_id, span_id)`.
    pub fn start_span_child(
        &self,
        name: &str,
        attrs: &[(&str, &str)],
        parent: Option<(u64, u64)>,
    ) -> Arc<Span> {
        let span_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (trace_id, parent_id) = match parent {
            Some((trace_id, parent_span)) => (trace_id, Some(parent_span)),
            None => (span_id, None),
        };
        let span = Arc::new(Span {
            trace_id,
            span_id,
            parent_id,
            name: name.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            start: Instant::now(),
            state: Mutex::new(SpanState {
                end: None,
                status: SpanStatus::Ok,
                error: None,
                events: Vec::new(),
            }),
        });
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(span.clone());
        span
    }

    /// Every span started so far, in start order.
    pub fn spans(&self) -> Vec<Arc<Span>> {
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The fiber-local slot tracking the current span. The `instrument`
    /// wrapper reads and restores it around instrumented effects.
    pub(crate) fn current_slot(&self) -> &FiberLocal<Option<(u64, u64)>> {
        &self.current
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer::new()
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("spans", &self.spans().len())
            .finish()
    }
}

/// A layer installing an empty [`Tracer`].
pub fn tracer_layer() -> Layer {
    Layer::from_value(Tracer::new())
}
