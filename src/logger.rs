//! The logger service: structured, leveled logging through the
//! environment. The default sink forwards to `tracing` events; tests
//! capture records in memory.

use std::sync::{Arc, Mutex};

use crate::layer::Layer;

/// Log severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Fine-grained diagnostic detail.
    Trace,
    /// Developer-facing debugging.
    Debug,
    /// Routine operational messages.
    Info,
    /// Something unexpected but tolerable.
    Warn,
    /// Something failed.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Where log records go.
pub trait LogSink: Send + Sync {
    /// Emit one record.
    fn log(&self, level: LogLevel, message: &str, tags: &[(&str, &str)]);
}

/// The logger service handle stored in the context.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    /// A logger over a custom sink.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Logger { sink }
    }

    /// The default logger, forwarding to `tracing` events.
    pub fn tracing() -> Self {
        Logger {
            sink: Arc::new(TracingSink),
        }
    }

    /// Emit a structured record.
    pub fn log(&self, level: LogLevel, message: &str, tags: &[(&str, &str)]) {
        self.sink.log(level, message, tags);
    }

    /// Emit at trace level.
    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message, &[]);
    }

    /// Emit at debug level.
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, &[]);
    }

    /// Emit at info level.
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, &[]);
    }

    /// Emit at warn level.
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message, &[]);
    }

    /// Emit at error level.
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, &[]);
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish()
    }
}

struct TracingSink;

fn render_tags(tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!(" [{}]", rendered.join(" "))
}

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str, tags: &[(&str, &str)]) {
        let tags = render_tags(tags);
        match level {
            LogLevel::Trace => tracing::trace!("{message}{tags}"),
            LogLevel::Debug => tracing::debug!("{message}{tags}"),
            LogLevel::Info => tracing::info!("{message}{tags}"),
            LogLevel::Warn => tracing::warn!("{message}{tags}"),
            LogLevel::Error => tracing::error!("{message}{tags}"),
        }
    }
}

/// One captured record from a [`MemoryLogSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The record's severity.
    pub level: LogLevel,
    /// The record's message.
    pub message: String,
    /// The record's structured tags.
    pub tags: Vec<(String, String)>,
}

/// A sink that retains records for assertions.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    /// An empty sink.
    pub fn new() -> Self {
        MemoryLogSink::default()
    }

    /// Every record captured so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, message: &str, tags: &[(&str, &str)]) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogEntry {
                level,
                message: message.to_string(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
    }
}

impl std::fmt::Debug for MemoryLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLogSink")
            .field("entries", &self.entries().len())
            .finish()
    }
}

/// A layer installing the tracing-backed [`Logger`].
pub fn logger_layer() -> Layer {
    Layer::from_value(Logger::tracing())
}
