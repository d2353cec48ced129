use serde_json::Value;
use uuid::Uuid;

use crate::logger::{FlowLogger, Logger};

/// Mint the trace id for a new flow instance. Called at the origin only
/// (trigger translation, manual emit); downstream emissions propagate the
/// origin's id unchanged.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// One emitted event on its way to subscribers. Not persisted; consumed by
/// zero or more subscriber invocations.
#[derive(Clone, Debug)]
pub struct Event {
    pub topic: String,
    pub data: Value,
    pub trace_id: String,
    pub flows: Vec<String>,
    pub logger: FlowLogger,
}

impl Event {
    pub fn new(
        topic: impl Into<String>,
        data: Value,
        trace_id: impl Into<String>,
        flows: Vec<String>,
        logger: Logger,
    ) -> Self {
        let trace_id = trace_id.into();
        let logger = FlowLogger::new(logger, trace_id.clone(), flows.clone());
        Self { topic: topic.into(), data, trace_id, flows, logger }
    }

    /// Construct an event at a flow origin with a fresh trace id.
    pub fn originate(
        topic: impl Into<String>,
        data: Value,
        flows: Vec<String>,
        logger: Logger,
    ) -> Self {
        Self::new(topic, data, new_trace_id(), flows, logger)
    }
}
