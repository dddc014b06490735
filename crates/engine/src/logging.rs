//! Structured event logging.
//!
//! Components report significant transitions (`step_ok`, `job_handled`, ...)
//! through an [`EventLogger`] supplied by the host. Field maps always carry the
//! tenant/job/source identifiers when they are known so external aggregation
//! can correlate across services.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Severity attached to a structured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info  => write!(f, "info"),
            Self::Warn  => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

pub type LogFields = BTreeMap<String, Value>;

/// Build a field map from `(name, value)` pairs.
pub fn log_fields<const N: usize>(pairs: [(&str, Value); N]) -> LogFields {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

/// Sink for structured events.
pub trait EventLogger: Send + Sync {
    fn log(&self, level: LogLevel, event: &str, fields: LogFields);
}

impl<F> EventLogger for F
where
    F: Fn(LogLevel, &str, LogFields) + Send + Sync,
{
    fn log(&self, level: LogLevel, event: &str, fields: LogFields) {
        self(level, event, fields)
    }
}

/// Forwards events to `tracing`, rendering the fields as one JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl EventLogger for TracingLogger {
    fn log(&self, level: LogLevel, event: &str, fields: LogFields) {
        let fields = Value::Object(fields.into_iter().collect());
        match level {
            LogLevel::Debug => tracing::debug!(event, %fields, "{event}"),
            LogLevel::Info  => tracing::info!(event, %fields, "{event}"),
            LogLevel::Warn  => tracing::warn!(event, %fields, "{event}"),
            LogLevel::Error => tracing::error!(event, %fields, "{event}"),
        }
    }
}

/// One captured event.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    pub level: LogLevel,
    pub event: String,
    pub fields: LogFields,
}

/// Keeps every event in memory; handy for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    events: Mutex<Vec<LoggedEvent>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events with the given name, in emission order.
    pub fn named(&self, event: &str) -> Vec<LoggedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.named(event).len()
    }
}

impl EventLogger for RecordingLogger {
    fn log(&self, level: LogLevel, event: &str, fields: LogFields) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LoggedEvent {
                level,
                event: event.to_owned(),
                fields,
            });
    }
}

/// Initialize tracing/logging for the process.
///
/// JSON logs with timestamps, filtered by `RUST_LOG` (default `info`).
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .try_init();
}
