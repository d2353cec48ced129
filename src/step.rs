use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One loaded step: where it lives on disk, a content version stamp, and its
/// parsed config record. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub file_path: PathBuf,
    pub version: String,
    pub config: StepConfig,
}

impl Step {
    pub fn new(file_path: impl Into<PathBuf>, version: impl Into<String>, config: StepConfig) -> Self {
        Self { file_path: file_path.into(), version: version.into(), config }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }
}

/// The `config` record a step file exports, discriminated by its `type`
/// field. Matched exhaustively everywhere; adding a variant is a compile
/// error until every consumer handles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepConfig {
    Api(ApiConfig),
    Event(EventConfig),
    Cron(CronConfig),
    Noop(NoopConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub name: String,
    pub path: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub emits: Vec<EmitDecl>,
    #[serde(default)]
    pub body_schema: Option<Value>,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub flows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventConfig {
    pub name: String,
    pub subscribes: Vec<String>,
    #[serde(default)]
    pub emits: Vec<EmitDecl>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub flows: Vec<String>,
    /// Serialize deliveries to this step within one trace instead of the
    /// default concurrent fan-in.
    #[serde(default)]
    pub serial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub emits: Vec<EmitDecl>,
    #[serde(default)]
    pub flows: Vec<String>,
}

/// Topology-only node: contributes virtual edges to the topic graph and is
/// never executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NoopConfig {
    pub name: String,
    #[serde(default)]
    pub virtual_emits: Vec<EmitDecl>,
    #[serde(default)]
    pub virtual_subscribes: Vec<String>,
    #[serde(default)]
    pub flows: Vec<String>,
}

/// An `emits` entry: either a bare topic or an annotated form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EmitDecl {
    Topic(String),
    Detailed {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conditional: Option<bool>,
    },
}

impl EmitDecl {
    pub fn topic(&self) -> &str {
        match self {
            EmitDecl::Topic(t) => t,
            EmitDecl::Detailed { topic, .. } => topic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "OPTIONS")]
    Options,
    #[serde(rename = "HEAD")]
    Head,
}

impl StepConfig {
    pub fn name(&self) -> &str {
        match self {
            StepConfig::Api(c) => &c.name,
            StepConfig::Event(c) => &c.name,
            StepConfig::Cron(c) => &c.name,
            StepConfig::Noop(c) => &c.name,
        }
    }

    pub fn flows(&self) -> &[String] {
        match self {
            StepConfig::Api(c) => &c.flows,
            StepConfig::Event(c) => &c.flows,
            StepConfig::Cron(c) => &c.flows,
            StepConfig::Noop(c) => &c.flows,
        }
    }

    /// Topics this step is allowed to emit. For noop steps these are the
    /// virtual edges it contributes to the graph.
    pub fn emit_topics(&self) -> Vec<&str> {
        let decls = match self {
            StepConfig::Api(c) => &c.emits,
            StepConfig::Event(c) => &c.emits,
            StepConfig::Cron(c) => &c.emits,
            StepConfig::Noop(c) => &c.virtual_emits,
        };
        decls.iter().map(EmitDecl::topic).collect()
    }

    /// Topics this step consumes (virtual ones included).
    pub fn subscribe_topics(&self) -> &[String] {
        match self {
            StepConfig::Event(c) => &c.subscribes,
            StepConfig::Noop(c) => &c.virtual_subscribes,
            StepConfig::Api(_) | StepConfig::Cron(_) => &[],
        }
    }

    /// Whether the executor may run this step. Noop nodes only shape the
    /// topology.
    pub fn executable(&self) -> bool {
        !matches!(self, StepConfig::Noop(_))
    }

    /// Handler signature toggle: steps without a payload get `(ctx)` instead
    /// of `(data, ctx)`.
    pub fn context_in_first_arg(&self) -> bool {
        matches!(self, StepConfig::Cron(_) | StepConfig::Noop(_))
    }

    pub fn serial(&self) -> bool {
        matches!(self, StepConfig::Event(c) if c.serial)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Api(_) => "api",
            StepConfig::Event(_) => "event",
            StepConfig::Cron(_) => "cron",
            StepConfig::Noop(_) => "noop",
        }
    }
}

/// A push stream declared at load time. `schema` is the JSON Schema of the
/// items the stream carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StreamDecl {
    pub name: String,
    pub schema: Value,
}
