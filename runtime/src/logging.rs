//! Log sinks.
//!
//! A [`LoggerSink`] receives whole lines. The cluster logger collects lines
//! from the driver and from every worker; job loggers tag lines with the
//! process they belong to.

use std::sync::Arc;

use stratus_types::{ProcessId, ProcessInfo};

pub trait LoggerSink: Send + Sync {
    fn log_line(&self, line: &str);
}

/// Discards every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl LoggerSink for NullLogger {
    fn log_line(&self, _line: &str) {}
}

/// Forwards lines to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl LoggerSink for TracingLogger {
    fn log_line(&self, line: &str) {
        tracing::info!(target: "stratus::cluster", "{line}");
    }
}

/// Adapts a closure into a sink.
pub struct FnLogger<F>(F);

impl<F> FnLogger<F>
where
    F: Fn(&str) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> LoggerSink for FnLogger<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn log_line(&self, line: &str) {
        (self.0)(line);
    }
}

/// Sink scoped to one submitted process.
#[derive(Clone)]
pub struct JobLogger {
    process: ProcessId,
    sink: Arc<dyn LoggerSink>,
}

impl JobLogger {
    #[must_use]
    pub fn process(&self) -> ProcessId {
        self.process
    }
}

impl LoggerSink for JobLogger {
    fn log_line(&self, line: &str) {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        self.sink
            .log_line(&format!("{now} [{}] {line}", self.process));
    }
}

#[derive(Clone)]
pub struct JobLoggerFactory {
    sink: Arc<dyn LoggerSink>,
}

impl JobLoggerFactory {
    #[must_use]
    pub fn new(sink: Arc<dyn LoggerSink>) -> Self {
        Self { sink }
    }

    #[must_use]
    pub fn create(&self, process: &ProcessInfo) -> JobLogger {
        JobLogger {
            process: process.id(),
            sink: Arc::clone(&self.sink),
        }
    }
}
