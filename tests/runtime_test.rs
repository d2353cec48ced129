//! End-to-end scenarios: steps written as small `sh` scripts speak the real
//! wire protocol through a passthrough runner, so the full chain
//! (event manager -> executor -> supervisor -> worker -> RPC -> state/streams)
//! is exercised without any language runtime installed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use polystep::event::Event;
use polystep::event_manager::EventManager;
use polystep::executor::StepExecutor;
use polystep::locked_data::LockedData;
use polystep::logger::{Logger, LoggerType};
use polystep::runner::{RunnerSpec, RunnerTable};
use polystep::state::{InMemoryStateStore, StateStore};
use polystep::step::{EmitDecl, EventConfig, Step, StepConfig};
use polystep::streams::StreamRegistry;
use step_rpc::message::LogLevel;

/// Test sink capturing every structured record.
#[derive(Clone, Default)]
struct CaptureLogger {
    records: Arc<Mutex<Vec<(LogLevel, String, String)>>>,
}

impl CaptureLogger {
    fn messages(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|r| r.2.clone()).collect()
    }

    fn errors(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.0 == LogLevel::Error)
            .map(|r| r.2.clone())
            .collect()
    }
}

impl LoggerType for CaptureLogger {
    fn log(
        &self,
        level: LogLevel,
        trace_id: &str,
        _step: Option<&str>,
        msg: &str,
        _fields: Option<&Map<String, Value>>,
    ) {
        self.records.lock().unwrap().push((level, trace_id.to_string(), msg.to_string()));
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "CaptureLogger".to_string()
    }
}

struct Harness {
    dir: TempDir,
    locked: Arc<LockedData>,
    state: Arc<dyn StateStore>,
    manager: EventManager,
    sink: CaptureLogger,
}

impl Harness {
    fn new(external_topics: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let runner_file = dir.path().join("runner.sh");
        std::fs::write(&runner_file, "#!/bin/sh\nexec sh \"$1\" \"$2\"\n").unwrap();

        let mut runners = RunnerTable::empty();
        for ext in ["sh", "shx"] {
            runners.register(
                ext,
                RunnerSpec {
                    command: "sh".into(),
                    args: vec![],
                    runner_file: runner_file.clone(),
                    config_file: runner_file.clone(),
                },
            );
        }

        let locked =
            Arc::new(LockedData::new(external_topics.iter().map(|s| s.to_string())));
        let state: Arc<dyn StateStore> = InMemoryStateStore::new(None);
        let streams = Arc::new(StreamRegistry::new());
        let sink = CaptureLogger::default();
        let logger = Logger(Box::new(sink.clone()));

        let (queue, rx) = EventManager::channel();
        let executor = Arc::new(StepExecutor::new(
            runners,
            Arc::clone(&state),
            streams,
            queue.clone(),
            logger,
        ));
        let manager = EventManager::start(queue, rx, Arc::clone(&locked), executor);

        Self { dir, locked, state, manager, sink }
    }

    /// Register an event step whose handler is an inline `sh` body. The body
    /// receives the invocation envelope as `$1`.
    fn add_step(&self, name: &str, ext: &str, subscribes: &[&str], emits: &[&str], body: &str) {
        let path = self.dir.path().join(format!("{name}.step.{ext}"));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        self.locked
            .add_step(Step::new(
                path,
                "1",
                StepConfig::Event(EventConfig {
                    name: name.into(),
                    subscribes: subscribes.iter().map(|s| s.to_string()).collect(),
                    emits: emits.iter().map(|t| EmitDecl::Topic(t.to_string())).collect(),
                    input_schema: None,
                    flows: vec!["it".into()],
                    serial: false,
                }),
            ))
            .unwrap();
    }

    fn event(&self, topic: &str, data: Value, trace: &str) -> Event {
        Event::new(topic, data, trace, vec!["it".into()], Logger(Box::new(self.sink.clone())))
    }

    async fn wait_for_state(&self, trace: &str, key: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(value) = self.state.get(trace, key).await.unwrap() {
                return value;
            }
            assert!(Instant::now() < deadline, "state {trace}/{key} never appeared");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Body that stores the whole envelope under `key`, then reports a result.
fn store_envelope_body(key: &str) -> String {
    format!(
        r#"printf '{{"type":"request","id":1,"method":"state.set","params":{{"traceId":"ignored","key":"{key}","value":%s}}}}\n' "$1"
printf '%s\n' '{{"type":"request","id":2,"method":"result","params":"stored"}}'"#
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn single_step_success_propagates_downstream() {
    let h = Harness::new(&["a"]);
    // S: subscribes a, emits b with a payload of its own
    h.add_step(
        "s",
        "sh",
        &["a"],
        &["b"],
        r#"printf '%s\n' '{"type":"request","id":1,"method":"emit","params":{"topic":"b","data":{"y":2}}}'
printf '%s\n' '{"type":"request","id":2,"method":"result"}'"#,
    );
    // collector: subscribes b, stores its envelope
    h.add_step("collector", "sh", &["b"], &[], &store_envelope_body("seen"));

    let scheduled =
        h.manager.emit_and_wait(h.event("a", json!({"x": 1}), "T1")).await.unwrap();
    assert_eq!(scheduled, 1);

    // the downstream invocation runs detached; its state write proves both
    // delivery and unchanged trace propagation
    let seen = h.wait_for_state("T1", "seen").await;
    assert_eq!(seen["traceId"], json!("T1"));
    assert_eq!(seen["data"], json!({"y": 2}));
    assert_eq!(h.sink.errors(), Vec::<String>::new());
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_emit_never_reaches_subscribers() {
    let h = Harness::new(&["a", "c"]);
    h.add_step(
        "sneaky",
        "sh",
        &["a"],
        &["b"],
        r#"printf '%s\n' '{"type":"request","id":1,"method":"emit","params":{"topic":"c","data":{}}}'
printf '%s\n' '{"type":"request","id":2,"method":"result"}'"#,
    );
    h.add_step("c-watcher", "sh", &["c"], &[], &store_envelope_body("c-seen"));

    h.manager.emit_and_wait(h.event("a", json!({}), "T1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.state.get("T1", "c-seen").await.unwrap(), None);
    let warnings: Vec<String> = h
        .sink
        .messages()
        .into_iter()
        .filter(|m| m.contains("invalid emit"))
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("sneaky") && warnings[0].contains("`c`"), "{}", warnings[0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_out_across_runners_delivers_identical_data() {
    let h = Harness::new(&["a"]);
    h.add_step("first", "sh", &["a"], &[], &store_envelope_body("first"));
    h.add_step("second", "shx", &["a"], &[], &store_envelope_body("second"));

    let scheduled =
        h.manager.emit_and_wait(h.event("a", json!({"n": 42}), "T1")).await.unwrap();
    assert_eq!(scheduled, 2);

    let first = h.wait_for_state("T1", "first").await;
    let second = h.wait_for_state("T1", "second").await;
    assert_eq!(first["data"], json!({"n": 42}));
    assert_eq!(first["data"], second["data"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn state_is_isolated_per_trace() {
    let h = Harness::new(&["a"]);
    h.add_step("writer", "sh", &["a"], &[], &store_envelope_body("env"));

    h.manager.emit_and_wait(h.event("a", json!({"who": "one"}), "T1")).await.unwrap();
    h.manager.emit_and_wait(h.event("a", json!({"who": "two"}), "T2")).await.unwrap();

    let t1 = h.wait_for_state("T1", "env").await;
    let t2 = h.wait_for_state("T2", "env").await;
    assert_eq!(t1["data"], json!({"who": "one"}));
    assert_eq!(t2["data"], json!({"who": "two"}));
    assert_eq!(t1["traceId"], json!("T1"));
    assert_eq!(t2["traceId"], json!("T2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_after_emit_still_delivers_and_spares_siblings() {
    let h = Harness::new(&["a"]);
    h.add_step(
        "crasher",
        "sh",
        &["a"],
        &["b"],
        r#"printf '%s\n' '{"type":"request","id":1,"method":"emit","params":{"topic":"b","data":{"from":"crasher"}}}'
exit 1"#,
    );
    h.add_step("sibling", "sh", &["a"], &[], &store_envelope_body("sibling"));
    h.add_step("b-watcher", "sh", &["b"], &[], &store_envelope_body("b-seen"));

    h.manager.emit_and_wait(h.event("a", json!({}), "T1")).await.unwrap();

    // the emit preceded the crash, so it is delivered
    let seen = h.wait_for_state("T1", "b-seen").await;
    assert_eq!(seen["data"], json!({"from": "crasher"}));
    // the sibling invocation is unaffected
    h.wait_for_state("T1", "sibling").await;
    // and the failure is reported with its exit code
    let errors = h.sink.errors();
    assert!(
        errors.iter().any(|m| m.contains("crasher") && m.contains("failed")),
        "{errors:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn hot_reload_swaps_subscriptions() {
    let h = Harness::new(&["a", "z"]);
    h.add_step("s", "sh", &["a"], &[], &store_envelope_body("before"));

    assert_eq!(h.manager.emit_and_wait(h.event("a", json!({}), "T1")).await.unwrap(), 1);

    // replace with a version that no longer subscribes `a`
    let path = h.dir.path().join("s2.step.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", store_envelope_body("after"))).unwrap();
    h.locked.remove_step("s").unwrap();
    h.locked
        .add_step(Step::new(
            path,
            "2",
            StepConfig::Event(EventConfig {
                name: "s".into(),
                subscribes: vec!["z".into()],
                emits: vec![],
                input_schema: None,
                flows: vec![],
                serial: false,
            }),
        ))
        .unwrap();

    assert_eq!(h.manager.emit_and_wait(h.event("a", json!({}), "T2")).await.unwrap(), 0);
    assert_eq!(h.state.get("T2", "before").await.unwrap(), None);
    assert_eq!(h.state.get("T2", "after").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_payload_is_delivered_as_is() {
    let h = Harness::new(&["a"]);
    h.add_step("writer", "sh", &["a"], &[], &store_envelope_body("env"));
    h.manager.emit_and_wait(h.event("a", Value::Null, "T1")).await.unwrap();
    let env = h.wait_for_state("T1", "env").await;
    assert_eq!(env["data"], Value::Null);
}
