//! Parameter and result shapes shared by the runtime and every language
//! runner. Field names are camelCase on the wire; runners in all supported
//! languages must produce and consume identical shapes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Invocation envelope handed to a runner as its final argv entry.
///
/// `context_in_first_arg` toggles the handler signature between
/// `(data, ctx)` and `(ctx)`; cron and noop-style steps receive no payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub data: Value,
    pub flows: Vec<String>,
    pub trace_id: String,
    pub context_in_first_arg: bool,
    #[serde(default)]
    pub streams: Vec<StreamRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StreamRef {
    pub name: String,
}

/// A structured log record sent by a worker over the `log` method.
/// Anything beyond level and message rides along as extra fields.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogEntry {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(alias = "message")]
    pub msg: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateKeyParams {
    pub trace_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateSetParams {
    pub trace_id: String,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateScopeParams {
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupParams {
    pub group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamItemParams {
    pub group_id: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamSetParams {
    pub group_id: String,
    pub id: String,
    pub data: Value,
}

/// Parameters of a worker-side `emit`. The runtime authorizes the topic
/// against the step's declared emits and injects its own trace id; a
/// `traceId` supplied by the worker is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmitParams {
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Deserialize RPC params, mapping failures to the `{error}` string the
/// worker-side client raises in the handler.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| format!("invalid params: {e}"))
}
