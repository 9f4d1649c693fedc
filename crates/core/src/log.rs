//! Log records emitted while loading and running reconcilers, and the sink
//! they are written to.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
    Debug,
    Separator,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
            LogLevel::Debug => "debug",
            LogLevel::Separator => "separator",
        }
    }

    /// Prefix put in front of the message when rendering.
    pub fn marker(&self) -> &'static str {
        match self {
            LogLevel::Info | LogLevel::Separator => "",
            LogLevel::Warn => "⚠️ ",
            LogLevel::Error => "ERROR: ",
            LogLevel::Success => "✅ ",
            LogLevel::Debug => "debug: ",
        }
    }

    /// Guess a level from free text (plain `print` output has none).
    pub fn classify(text: &str) -> Self {
        if text.starts_with("━━━") {
            return LogLevel::Separator;
        }
        let lower = text.to_lowercase();
        if lower.contains("error") || text.contains('❌') || lower.contains("failed") {
            LogLevel::Error
        } else if lower.contains("success") || text.contains('✅') || lower.contains("complete") {
            LogLevel::Success
        } else if lower.contains("warn") || text.contains("⚠️") {
            LogLevel::Warn
        } else if lower.contains("debug") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self { ts: Utc::now(), level, message: message.into() }
    }

    pub fn info(message: impl Into<String>) -> Self { Self::new(LogLevel::Info, message) }
    pub fn warn(message: impl Into<String>) -> Self { Self::new(LogLevel::Warn, message) }
    pub fn error(message: impl Into<String>) -> Self { Self::new(LogLevel::Error, message) }
    pub fn success(message: impl Into<String>) -> Self { Self::new(LogLevel::Success, message) }
    pub fn debug(message: impl Into<String>) -> Self { Self::new(LogLevel::Debug, message) }
    pub fn separator() -> Self { Self::new(LogLevel::Separator, SEPARATOR) }

    /// Human-readable single line: `[HH:MM:SS] <marker><message>`.
    /// Separators render bare so consumers can spot them by prefix.
    pub fn render(&self) -> String {
        if self.level == LogLevel::Separator {
            return self.message.clone();
        }
        let marker = self.level.marker();
        let marker = if self.message.starts_with(marker.trim_end()) { "" } else { marker };
        format!("[{}] {}{}", self.ts.format("%H:%M:%S"), marker, self.message)
    }
}

impl std::fmt::Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.render()) }
}

/// Destination for log records. Passed explicitly to the store, the loader
/// and the dispatcher; the process wires it to the broadcaster.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);

    fn info(&self, msg: &str) { self.emit(LogRecord::info(msg)) }
    fn warn(&self, msg: &str) { self.emit(LogRecord::warn(msg)) }
    fn error(&self, msg: &str) { self.emit(LogRecord::error(msg)) }
    fn success(&self, msg: &str) { self.emit(LogRecord::success(msg)) }
    fn debug(&self, msg: &str) { self.emit(LogRecord::debug(msg)) }
    fn separator(&self) { self.emit(LogRecord::separator()) }
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn emit(&self, record: LogRecord) { (**self).emit(record) }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _record: LogRecord) {}
}

/// Keeps every record in memory; handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn messages(&self) -> Vec<String> { self.records().into_iter().map(|r| r.message).collect() }

    pub fn count(&self, level: LogLevel) -> usize { self.records().iter().filter(|r| r.level == level).count() }

    pub fn clear(&self) {
        match self.records.lock() {
            Ok(mut g) => g.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        match self.records.lock() {
            Ok(mut g) => g.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
