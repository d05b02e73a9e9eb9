use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use flow_api::LogLevel;
use tracing_appender::{non_blocking::WorkerGuard, rolling::{RollingFileAppender, Rotation}};
use tracing_subscriber::{EnvFilter, Registry, fmt as tfmt, prelude::*};

/// Where engine logs go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    pub json: bool,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>, json: bool) -> Self {
        Self { log_level, log_dir, json }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            json: false,
        }
    }
}

fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error | LogLevel::Critical => "error",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Engine logs go to
/// stderr so stdout stays free for published messages. When `log_dir` is
/// set, a daily-rolling plain-text file is written as well; keep the
/// returned guard alive for as long as logs should be flushed.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.log_level)));

    let stderr_layer = if config.json {
        tfmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tfmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "telemetry-flows.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tfmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(guard)
}

/// Destination of the log lines flows write through their context.
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, flow: &str, msg: &str);
    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn LoggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Forwards flow log lines to `tracing`, tagged with the flow id.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, flow: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "flow", %flow, "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "flow", %flow, "{msg}"),
            LogLevel::Info => tracing::info!(target: "flow", %flow, "{msg}"),
            LogLevel::Warn => tracing::warn!(target: "flow", %flow, "{msg}"),
            LogLevel::Error => tracing::error!(target: "flow", %flow, "{msg}"),
            LogLevel::Critical => tracing::error!(target: "flow", %flow, "[CRITICAL] {msg}"),
        }
    }

    fn name(&self) -> &'static str {
        "TracingLogger"
    }
}

/// A captured flow log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub flow: String,
    pub message: String,
}

/// Keeps every line in memory. Handy for inspecting what flows logged.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<LogLine>>,
}

impl MemoryLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.message.contains(needle))
    }
}

impl LoggerType for MemoryLogger {
    fn log(&self, level: LogLevel, flow: &str, msg: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogLine {
                level,
                flow: flow.to_string(),
                message: msg.to_string(),
            });
    }

    fn name(&self) -> &'static str {
        "MemoryLogger"
    }
}

/// Write-only log sink handed to a flow, already bound to the flow's id.
#[derive(Clone)]
pub struct FlowLogger {
    sink: Arc<dyn LoggerType>,
    flow: Arc<str>,
}

impl fmt::Debug for FlowLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowLogger")
            .field("sink", &self.sink.name())
            .field("flow", &self.flow)
            .finish()
    }
}

impl FlowLogger {
    pub fn new(sink: Arc<dyn LoggerType>, flow: impl Into<Arc<str>>) -> Self {
        Self { sink, flow: flow.into() }
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        self.sink.log(level, &self.flow, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_captures_flow_id() {
        let sink = MemoryLogger::new();
        let logger = FlowLogger::new(sink.clone(), "events");
        logger.info("Processing message");
        logger.warn("Skipping message");

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].flow, "events");
        assert_eq!(lines[1].level, LogLevel::Warn);
        assert!(sink.contains("Skipping"));
    }

    #[test]
    fn test_filter_directive_maps_critical_to_error() {
        assert_eq!(filter_directive(LogLevel::Critical), "error");
        assert_eq!(filter_directive(LogLevel::Debug), "debug");
    }
}
