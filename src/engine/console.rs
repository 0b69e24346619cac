//! Diagnostic sink shared by connections and queries
//!
//! The sink is passed into constructors instead of writing to a global.
//! [`TracingSink`] forwards to `tracing`; [`MemorySink`] keeps the lines
//! so callers can inspect what happened.

use std::sync::{Arc, Mutex};

pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to the `tracing` macros under the `objectdb` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::debug!(target: "objectdb", "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "objectdb", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "objectdb", "{}", message);
    }
}

pub fn default_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Info,
    Error,
}

/// Buffers every line in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// True if a line at `level` contains `fragment`.
    pub fn contains(&self, level: LogLevel, fragment: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, line)| *l == level && line.contains(fragment))
    }

    fn push(&self, level: LogLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str) {
        self.push(LogLevel::Log, message);
    }

    fn info(&self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_levels() {
        let sink = MemorySink::new();
        sink.info("opened App");
        sink.error("upgrade failed");

        assert!(sink.contains(LogLevel::Info, "App"));
        assert!(sink.contains(LogLevel::Error, "failed"));
        assert!(!sink.contains(LogLevel::Log, "App"));
        assert_eq!(sink.lines().len(), 2);
    }
}
