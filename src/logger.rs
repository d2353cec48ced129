use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use step_rpc::message::{LogEntry, LogLevel};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    /// Dev mode: human-oriented pretty output on stdout instead of JSON lines.
    pub pretty: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into(), dir: None, otel_endpoint: None, pretty: false }
    }
}

/// Pluggable structured sink. Every record carries the trace context of the
/// flow it belongs to; transports are swapped by replacing the boxed impl.
pub trait LoggerType: Send + Sync {
    fn log(
        &self,
        level: LogLevel,
        trace_id: &str,
        step: Option<&str>,
        msg: &str,
        fields: Option<&Map<String, Value>>,
    );
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn into_inner(self) -> Box<dyn LoggerType> {
        self.0
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Default sink: forwards into the `tracing` stack installed by
/// [`init_tracing`].
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl LoggerType for TracingLogger {
    fn log(
        &self,
        level: LogLevel,
        trace_id: &str,
        step: Option<&str>,
        msg: &str,
        fields: Option<&Map<String, Value>>,
    ) {
        let step = step.unwrap_or("-");
        let fields = fields.filter(|f| !f.is_empty()).map(|f| Value::Object(f.clone()).to_string());
        match (level, fields) {
            (LogLevel::Trace, Some(x)) => tracing::trace!(%trace_id, step, fields = %x, "{msg}"),
            (LogLevel::Trace, None) => tracing::trace!(%trace_id, step, "{msg}"),
            (LogLevel::Debug, Some(x)) => tracing::debug!(%trace_id, step, fields = %x, "{msg}"),
            (LogLevel::Debug, None) => tracing::debug!(%trace_id, step, "{msg}"),
            (LogLevel::Info, Some(x)) => tracing::info!(%trace_id, step, fields = %x, "{msg}"),
            (LogLevel::Info, None) => tracing::info!(%trace_id, step, "{msg}"),
            (LogLevel::Warn, Some(x)) => tracing::warn!(%trace_id, step, fields = %x, "{msg}"),
            (LogLevel::Warn, None) => tracing::warn!(%trace_id, step, "{msg}"),
            (LogLevel::Error, Some(x)) => tracing::error!(%trace_id, step, fields = %x, "{msg}"),
            (LogLevel::Error, None) => tracing::error!(%trace_id, step, "{msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// A logger bound to one flow instance: carries the trace id, the flow
/// labels, and optionally the step it is tagged with.
#[derive(Clone, Debug)]
pub struct FlowLogger {
    logger: Logger,
    trace_id: String,
    step: Option<String>,
    flows: Vec<String>,
}

impl FlowLogger {
    pub fn new(logger: Logger, trace_id: impl Into<String>, flows: Vec<String>) -> Self {
        Self { logger, trace_id: trace_id.into(), step: None, flows }
    }

    /// Derive a logger tagged with a step name.
    pub fn child(&self, step: &str) -> Self {
        let mut child = self.clone();
        child.step = Some(step.to_string());
        child
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn flows(&self) -> &[String] {
        &self.flows
    }

    pub fn log(&self, level: LogLevel, msg: &str, fields: Option<&Map<String, Value>>) {
        self.logger.0.log(level, &self.trace_id, self.step.as_deref(), msg, fields);
    }

    pub fn log_entry(&self, entry: &LogEntry) {
        self.log(entry.level, &entry.msg, Some(&entry.fields));
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg, None);
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg, None);
    }

    pub fn warn(&self, msg: &str) {
        self.log(LogLevel::Warn, msg, None);
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg, None);
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("polystep").build())
        .clone()
}

fn init_otlp_logs(endpoint: &str) -> SdkLoggerProvider {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .expect("log-exporter");
    SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build()
}

/// Install the global tracing stack per config and hand back the runtime's
/// logger. Transports: rolling file when `dir` is set, OTLP when
/// `otel_endpoint` is set, stdout otherwise. Safe to call more than once;
/// later calls keep the first subscriber.
pub fn init_tracing(cfg: &LogConfig) -> Result<Logger> {
    let filter = || EnvFilter::new(cfg.level.clone());

    if let Some(endpoint) = &cfg.otel_endpoint {
        let provider = init_otlp_logs(endpoint);
        let bridge = OpenTelemetryTracingBridge::new(&provider).with_filter(filter());
        let fmt_layer = fmt::layer().with_target(false).with_filter(filter());
        let _ = Registry::default().with(bridge).with(fmt_layer).try_init();
    } else if let Some(dir) = &cfg.dir {
        std::fs::create_dir_all(dir)?;
        let appender = daily(dir, "polystep.log");
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(appender)
            .with_filter(filter());
        if cfg.pretty {
            let stdout_layer = fmt::layer().pretty().with_filter(filter());
            let _ = Registry::default().with(file_layer).with(stdout_layer).try_init();
        } else {
            let _ = Registry::default().with(file_layer).try_init();
        }
    } else if cfg.pretty {
        let _ = Registry::default().with(fmt::layer().pretty().with_filter(filter())).try_init();
    } else {
        let json_layer = fmt::layer().json().with_target(false).with_filter(filter());
        let _ = Registry::default().with(json_layer).try_init();
    }

    Ok(Logger(Box::new(TracingLogger::new())))
}
