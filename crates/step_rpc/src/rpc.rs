use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Wire frames for the runner protocol spoken between the runtime and a
/// worker process over the worker's stdin/stdout.
///
/// One frame per line, UTF-8 JSON. The runtime is the *server* for the
/// side-effect methods a handler may call (`log`, `state.*`, `streams.*`,
/// `emit`, `result`) and the *client* for `close`. Request ids are
/// monotonically increasing within one process side; a response carries the
/// id of the request it answers.
///
/// Usage example (with `serde_json`):
/// ```ignore
/// use step_rpc::rpc::{Frame, Method};
///
/// let req = Frame::request(1, Method::Emit, Some(json!({"topic": "greeted"})));
/// let line = req.encode();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    pub fn request<M: Into<String>>(id: u64, method: M, params: Option<Value>) -> Self {
        Frame::Request { id, method: method.into(), params }
    }

    /// Convenience helper for a successful result.
    pub fn response_ok(id: u64, result: Value) -> Self {
        Frame::Response { id, result: Some(result), error: None }
    }

    /// Convenience helper for an error result.
    pub fn response_err(id: u64, message: impl Into<String>) -> Self {
        Frame::Response { id, result: None, error: Some(message.into()) }
    }

    /// Serialize to a single wire line (no trailing newline).
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    /// Parse one wire line. Lines that are not frames (worker print output,
    /// diagnostics) fail here and are handled by the caller's classifier.
    pub fn decode(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Strongly-typed list of method names the runtime serves for workers.
///
/// Stream methods are namespaced per declared stream (`streams.<name>.get`
/// and friends) and therefore dispatched by string; this enum covers the
/// fixed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
pub enum Method {
    #[strum(serialize = "log")]
    Log,
    #[strum(serialize = "state.get")]
    StateGet,
    #[strum(serialize = "state.set")]
    StateSet,
    #[strum(serialize = "state.delete")]
    StateDelete,
    #[strum(serialize = "state.clear")]
    StateClear,
    #[strum(serialize = "state.getGroup")]
    StateGetGroup,
    #[strum(serialize = "emit")]
    Emit,
    #[strum(serialize = "result")]
    Result,
    #[strum(serialize = "close")]
    Close,
}

impl Method {
    /// Method name for one operation of a named stream, e.g.
    /// `streams.weather.set`.
    pub fn stream(stream: &str, op: StreamOp) -> String {
        format!("streams.{}.{}", stream, op.as_ref())
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
pub enum StreamOp {
    #[strum(serialize = "get")]
    Get,
    #[strum(serialize = "set")]
    Set,
    #[strum(serialize = "delete")]
    Delete,
    #[strum(serialize = "getGroup")]
    GetGroup,
}
