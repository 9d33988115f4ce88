//! # Logger Service
//!
//! This crate implements structured logging.
//!
//! ## Philosophy
//!
//! Logging is explicit and structured, not text-based or printf-style.
//! Components build a [`LogEntry`] and hand it to a [`LogSink`]; they never
//! print. The host decides where entries go: the `log` facade for a live
//! run, or memory for tests that assert on the exact trace.

use core_types::UnitId;
use std::fmt;
use std::sync::Mutex;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational messages
    Info,
    /// Warnings
    Warn,
    /// Errors
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// A structured log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Emitting component ("kernel", "timer", "unit", ...)
    pub component: &'static str,
    /// Source unit (if any)
    pub source: Option<UnitId>,
    /// Log message
    pub message: String,
    /// Structured fields, in insertion order
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Creates a new log entry
    pub fn new(level: LogLevel, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            level,
            component,
            source: None,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Sets the source unit
    pub fn with_source(mut self, source: UnitId) -> Self {
        self.source = Some(source);
        self
    }

    /// Adds a field to the log entry
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    /// Returns the value of the first field named `key`
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Renders as `message key=value key=value`
impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(source) = self.source {
            write!(f, " source={}", source)?;
        }
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Destination for structured log entries
pub trait LogSink: Send + Sync {
    fn record(&self, entry: LogEntry);
}

/// Forwards entries to the `log` facade, one line per entry
///
/// The component name becomes the log target, so `RUST_LOG=kernel=debug`
/// works as expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFacadeSink;

impl LogSink for LogFacadeSink {
    fn record(&self, entry: LogEntry) {
        let level: log::Level = entry.level.into();
        log::log!(target: entry.component, level, "{}", entry);
    }
}

/// Keeps every entry in memory
///
/// Optionally forwards to the `log` facade as well, so a test run with
/// `RUST_LOG` set still shows the trace.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
    forward: bool,
}

impl MemoryLogSink {
    /// Creates an empty sink that only records
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty sink that also forwards to the `log` facade
    pub fn forwarding() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            forward: true,
        }
    }

    /// Returns a copy of all recorded entries
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the rendered lines of all recorded entries
    pub fn lines(&self) -> Vec<String> {
        self.entries().iter().map(ToString::to_string).collect()
    }

    /// Returns entries whose `event` field equals `event`
    pub fn events(&self, event: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.field("event") == Some(event))
            .collect()
    }

    /// Clears all recorded entries
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, entry: LogEntry) {
        if self.forward {
            LogFacadeSink.record(entry.clone());
        }
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
