//! The step executor: given a step and a triggering event, spawn the
//! matching language runner, broker every side effect the worker requests
//! over RPC, and report exactly one terminal state.
//!
//! Side effects are executed *by the runtime* under the runtime's trace
//! context. A worker cannot forge a trace it was not given: the trace id on
//! state operations and emits is injected here, whatever the worker sent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use step_rpc::message::{
    parse_params, EmitParams, Envelope, GroupParams, LogEntry, LogLevel, StateKeyParams,
    StateScopeParams, StateSetParams, StreamItemParams, StreamRef, StreamSetParams,
};
use step_rpc::rpc::{Method, StreamOp as WireOp};
use step_rpc::supervisor::{handler_fn, KillHandle, RunnerSupervisor, SupervisorError};

use crate::event::Event;
use crate::event_manager::{EmitQueue, StepInvoker};
use crate::logger::{FlowLogger, Logger};
use crate::runner::RunnerTable;
use crate::state::StateStore;
use crate::step::Step;
use crate::streams::StreamRegistry;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("unsupported step file extension `{0}`")]
    UnsupportedExtension(String),
    #[error("Executable {0} not found")]
    RunnerNotFound(String),
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
    #[error("Process exited with code {code}")]
    WorkerFailed {
        code: i32,
        /// Last stderr line, usually the tail of the worker's own error
        /// report.
        stderr: Option<String>,
    },
    #[error("Process terminated by signal")]
    Signalled,
    #[error("rpc protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invocation cancelled")]
    Cancelled,
}

/// Terminal state of one invocation; every spawn reports exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure,
    Cancelled,
}

struct ActiveInvocation {
    kill: KillHandle,
    cancelled: Arc<AtomicBool>,
}

/// Guards the `result` terminal: any frame after it is a protocol error.
#[derive(Clone)]
struct ResultGate {
    seen: Arc<AtomicBool>,
    killer: KillHandle,
}

impl ResultGate {
    fn check(&self) -> Result<(), String> {
        if self.seen.load(Ordering::SeqCst) {
            let msg = "request received after result";
            self.killer.trip(msg);
            Err(msg.to_string())
        } else {
            Ok(())
        }
    }

    fn mark(&self) {
        self.seen.store(true, Ordering::SeqCst);
    }
}

pub struct StepExecutor {
    runners: RunnerTable,
    state: Arc<dyn StateStore>,
    streams: Arc<StreamRegistry>,
    emits: EmitQueue,
    logger: Logger,
    active: DashMap<u64, ActiveInvocation>,
    next_invocation: AtomicU64,
}

impl StepExecutor {
    pub fn new(
        runners: RunnerTable,
        state: Arc<dyn StateStore>,
        streams: Arc<StreamRegistry>,
        emits: EmitQueue,
        logger: Logger,
    ) -> Self {
        Self {
            runners,
            state,
            streams,
            emits,
            logger,
            active: DashMap::new(),
            next_invocation: AtomicU64::new(1),
        }
    }

    /// Abort a running invocation; its worker is killed and the invocation
    /// resolves `Cancelled`. Returns false when the id is not active.
    pub fn cancel(&self, invocation: u64) -> bool {
        match self.active.get(&invocation) {
            Some(active) => {
                active.cancelled.store(true, Ordering::SeqCst);
                active.kill.kill();
                true
            }
            None => false,
        }
    }

    pub fn active_invocations(&self) -> Vec<u64> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub async fn execute(&self, step: Arc<Step>, event: Event) -> Result<Option<Value>, StepError> {
        if !step.config.executable() {
            debug!(step = %step.name(), "noop step is topology-only, skipping");
            return Ok(None);
        }

        let invocation = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let log = event.logger.child(step.name());
        let started = Instant::now();

        let runner = self.runners.for_path(&step.file_path)?.clone();
        let envelope = Envelope {
            data: event.data.clone(),
            flows: step.config.flows().to_vec(),
            trace_id: event.trace_id.clone(),
            context_in_first_arg: step.config.context_in_first_arg(),
            streams: self.streams.declared().into_iter().map(|name| StreamRef { name }).collect(),
        };
        let envelope_json = serde_json::to_string(&envelope)
            .map_err(|e| StepError::SpawnFailed(e.to_string()))?;
        let (command, args) = runner.invocation(&step.file_path, &envelope_json);

        let mut sup = RunnerSupervisor::new(command, args, HashMap::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.insert(
            invocation,
            ActiveInvocation { kill: sup.kill_handle(), cancelled: Arc::clone(&cancelled) },
        );

        let result_slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let last_stderr: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        self.install_channel(&mut sup, &step, &event, &log, &result_slot, &last_stderr);

        let outcome = self.drive(&mut sup, &log).await;
        sup.shutdown();
        self.active.remove(&invocation);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Err(e) => Err(e),
            Ok(exit) => {
                if let Some(violation) = sup.violation() {
                    Err(StepError::ProtocolViolation(violation))
                } else if cancelled.load(Ordering::SeqCst) {
                    Err(StepError::Cancelled)
                } else {
                    match exit.code {
                        Some(0) => Ok(result_slot.lock().unwrap().take()),
                        Some(code) => Err(StepError::WorkerFailed {
                            code,
                            stderr: last_stderr.lock().unwrap().take(),
                        }),
                        None => Err(StepError::Signalled),
                    }
                }
            }
        };

        self.report(&log, step.name(), &result, elapsed_ms);
        result
    }

    /// Register every parent-served method for this invocation, plus the
    /// stdout classifier and the stderr relay.
    fn install_channel(
        &self,
        sup: &mut RunnerSupervisor,
        step: &Arc<Step>,
        event: &Event,
        log: &FlowLogger,
        result_slot: &Arc<Mutex<Option<Value>>>,
        last_stderr: &Arc<Mutex<Option<String>>>,
    ) {
        let gate = ResultGate { seen: Arc::new(AtomicBool::new(false)), killer: sup.kill_handle() };
        let trace = event.trace_id.clone();

        // stdout that is not a frame: JSON objects become structured logs,
        // anything else is plain text
        {
            let log = log.clone();
            sup.on_stdout(Arc::new(move |line| classify_stdout(&log, &line)));
        }
        {
            let log = log.clone();
            let last_stderr = Arc::clone(last_stderr);
            sup.on_stderr(Arc::new(move |line| {
                log.error(&line);
                *last_stderr.lock().unwrap() = Some(line);
            }));
        }

        // log(entry)
        {
            let log = log.clone();
            let gate = gate.clone();
            sup.handler(
                Method::Log.as_ref(),
                handler_fn(move |params| {
                    let log = log.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let entry: LogEntry = parse_params(params)?;
                        log.log_entry(&entry);
                        Ok(Value::Null)
                    }
                }),
            );
        }

        // state.*, always under this invocation's trace
        {
            let state = Arc::clone(&self.state);
            let trace = trace.clone();
            let gate = gate.clone();
            sup.handler(
                Method::StateGet.as_ref(),
                handler_fn(move |params| {
                    let state = Arc::clone(&state);
                    let trace = trace.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let p: StateKeyParams = parse_params(params)?;
                        let value = state.get(&trace, &p.key).await.map_err(|e| e.to_string())?;
                        Ok(value.unwrap_or(Value::Null))
                    }
                }),
            );
        }
        {
            let state = Arc::clone(&self.state);
            let trace = trace.clone();
            let gate = gate.clone();
            sup.handler(
                Method::StateSet.as_ref(),
                handler_fn(move |params| {
                    let state = Arc::clone(&state);
                    let trace = trace.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let p: StateSetParams = parse_params(params)?;
                        state.set(&trace, &p.key, p.value).await.map_err(|e| e.to_string())?;
                        Ok(Value::Null)
                    }
                }),
            );
        }
        {
            let state = Arc::clone(&self.state);
            let trace = trace.clone();
            let gate = gate.clone();
            sup.handler(
                Method::StateDelete.as_ref(),
                handler_fn(move |params| {
                    let state = Arc::clone(&state);
                    let trace = trace.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let p: StateKeyParams = parse_params(params)?;
                        state.delete(&trace, &p.key).await.map_err(|e| e.to_string())?;
                        Ok(Value::Null)
                    }
                }),
            );
        }
        {
            let state = Arc::clone(&self.state);
            let trace = trace.clone();
            let gate = gate.clone();
            sup.handler(
                Method::StateClear.as_ref(),
                handler_fn(move |params| {
                    let state = Arc::clone(&state);
                    let trace = trace.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let _: StateScopeParams = parse_params(params)?;
                        state.clear(&trace).await.map_err(|e| e.to_string())?;
                        Ok(Value::Null)
                    }
                }),
            );
        }
        {
            let state = Arc::clone(&self.state);
            let gate = gate.clone();
            sup.handler(
                Method::StateGetGroup.as_ref(),
                handler_fn(move |params| {
                    let state = Arc::clone(&state);
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let p: GroupParams = parse_params(params)?;
                        let values = state.get_group(&p.group_id).await.map_err(|e| e.to_string())?;
                        Ok(Value::Array(values))
                    }
                }),
            );
        }

        // streams.<name>.* for every declared stream
        for name in self.streams.declared() {
            {
                let streams = Arc::clone(&self.streams);
                let stream = name.clone();
                let gate = gate.clone();
                sup.handler(
                    Method::stream(&name, WireOp::Get),
                    handler_fn(move |params| {
                        let streams = Arc::clone(&streams);
                        let stream = stream.clone();
                        let gate = gate.clone();
                        async move {
                            gate.check()?;
                            let p: StreamItemParams = parse_params(params)?;
                            let value = streams
                                .get(&stream, &p.group_id, &p.id)
                                .map_err(|e| e.to_string())?;
                            Ok(value.unwrap_or(Value::Null))
                        }
                    }),
                );
            }
            {
                let streams = Arc::clone(&self.streams);
                let stream = name.clone();
                let gate = gate.clone();
                sup.handler(
                    Method::stream(&name, WireOp::Set),
                    handler_fn(move |params| {
                        let streams = Arc::clone(&streams);
                        let stream = stream.clone();
                        let gate = gate.clone();
                        async move {
                            gate.check()?;
                            let p: StreamSetParams = parse_params(params)?;
                            streams
                                .set(&stream, &p.group_id, &p.id, p.data)
                                .map_err(|e| e.to_string())
                        }
                    }),
                );
            }
            {
                let streams = Arc::clone(&self.streams);
                let stream = name.clone();
                let gate = gate.clone();
                sup.handler(
                    Method::stream(&name, WireOp::Delete),
                    handler_fn(move |params| {
                        let streams = Arc::clone(&streams);
                        let stream = stream.clone();
                        let gate = gate.clone();
                        async move {
                            gate.check()?;
                            let p: StreamItemParams = parse_params(params)?;
                            streams.delete(&stream, &p.group_id, &p.id).map_err(|e| e.to_string())?;
                            Ok(Value::Null)
                        }
                    }),
                );
            }
            {
                let streams = Arc::clone(&self.streams);
                let stream = name.clone();
                let gate = gate.clone();
                sup.handler(
                    Method::stream(&name, WireOp::GetGroup),
                    handler_fn(move |params| {
                        let streams = Arc::clone(&streams);
                        let stream = stream.clone();
                        let gate = gate.clone();
                        async move {
                            gate.check()?;
                            let p: GroupParams = parse_params(params)?;
                            let values =
                                streams.get_group(&stream, &p.group_id).map_err(|e| e.to_string())?;
                            Ok(Value::Array(values))
                        }
                    }),
                );
            }
        }

        // emit, authorized against the step's declared topics; the trace id
        // is always this invocation's
        {
            let allowed: HashSet<String> =
                step.config.emit_topics().into_iter().map(str::to_string).collect();
            let queue = self.emits.clone();
            let logger = self.logger.clone();
            let log = log.clone();
            let step_name = step.name().to_string();
            let flows = step.config.flows().to_vec();
            let trace = trace.clone();
            let gate = gate.clone();
            sup.handler(
                Method::Emit.as_ref(),
                handler_fn(move |params| {
                    let allowed = allowed.clone();
                    let queue = queue.clone();
                    let logger = logger.clone();
                    let log = log.clone();
                    let step_name = step_name.clone();
                    let flows = flows.clone();
                    let trace = trace.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        let p: EmitParams = parse_params(params)?;
                        if !allowed.contains(&p.topic) {
                            log.warn(&format!(
                                "invalid emit: step `{step_name}` does not declare topic `{}`",
                                p.topic
                            ));
                            return Ok(Value::Null);
                        }
                        let event = Event::new(p.topic, p.data, trace, flows, logger);
                        queue.emit(event).map_err(|e| e.to_string())?;
                        Ok(Value::Null)
                    }
                }),
            );
        }

        // result(value): store, then ask the worker to drain and exit
        {
            let slot = Arc::clone(result_slot);
            let sender = sup.sender();
            let gate = gate.clone();
            sup.handler(
                Method::Result.as_ref(),
                handler_fn(move |params| {
                    let slot = Arc::clone(&slot);
                    let sender = sender.clone();
                    let gate = gate.clone();
                    async move {
                        gate.check()?;
                        *slot.lock().unwrap() = params;
                        gate.mark();
                        let _ = sender.notify(Method::Close.as_ref(), None);
                        Ok(Value::Null)
                    }
                }),
            );
        }
    }

    async fn drive(
        &self,
        sup: &mut RunnerSupervisor,
        log: &FlowLogger,
    ) -> Result<step_rpc::ProcessExit, StepError> {
        match sup.spawn().await {
            Ok(()) => {}
            Err(SupervisorError::ExecutableNotFound(command)) => {
                log.error(&format!("Executable {command} not found"));
                return Err(StepError::RunnerNotFound(command));
            }
            Err(e) => return Err(StepError::SpawnFailed(e.to_string())),
        }
        sup.wait().await.map_err(|e| StepError::SpawnFailed(e.to_string()))
    }

    fn report(
        &self,
        log: &FlowLogger,
        step: &str,
        result: &Result<Option<Value>, StepError>,
        elapsed_ms: u64,
    ) {
        let mut fields = Map::new();
        fields.insert("elapsedMs".into(), Value::from(elapsed_ms));
        let completion = match result {
            Ok(_) => Completion::Success,
            Err(StepError::Cancelled) => Completion::Cancelled,
            Err(_) => Completion::Failure,
        };
        match (completion, result) {
            (Completion::Success, _) => log.log(LogLevel::Info, "step completed", Some(&fields)),
            (Completion::Cancelled, _) => log.log(LogLevel::Warn, "step cancelled", Some(&fields)),
            (Completion::Failure, Err(e)) => {
                fields.insert("error".into(), Value::String(e.to_string()));
                log.log(LogLevel::Error, &format!("step `{step}` failed"), Some(&fields));
            }
            (Completion::Failure, Ok(_)) => unreachable!(),
        }
    }
}

#[async_trait]
impl StepInvoker for StepExecutor {
    async fn invoke(&self, step: Arc<Step>, event: Event) -> Result<Option<Value>, StepError> {
        self.execute(step, event).await
    }
}

fn classify_stdout(log: &FlowLogger, line: &str) {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(mut map)) => {
            let level = map
                .remove("level")
                .and_then(|v| serde_json::from_value::<LogLevel>(v).ok())
                .unwrap_or_default();
            let msg = map
                .remove("msg")
                .or_else(|| map.remove("message"))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            log.log(level, &msg, Some(&map));
        }
        _ => log.info(line),
    }
}
