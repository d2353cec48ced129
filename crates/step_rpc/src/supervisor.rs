//! Parent-side owner of a single worker process and its RPC channel.
//!
//! The supervisor spawns the worker with piped stdio, then runs three tasks:
//! a writer draining queued outbound frames into the worker's stdin, a reader
//! classifying the worker's stdout (frames are dispatched, everything else is
//! relayed to the stdout sink), and a reaper owning the `Child` so that
//! `kill()` and `wait()` cannot race each other.
//!
//! Incoming requests are served **serially, in arrival order**: the reader
//! awaits each handler inline before touching the next line, so responses
//! leave in request order and one worker is a single cooperative task from
//! the runtime's point of view.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::rpc::{Frame, Method};

/// A parent-side RPC handler: receives the request params, returns the result
/// or the error string sent back to the worker.
pub type RpcHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Sink for non-frame output lines (worker prints, runtime diagnostics).
pub type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// Adapt a plain async closure into an [`RpcHandler`].
pub fn handler_fn<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(move |params| -> BoxFuture<'static, Result<Value, String>> {
        Box::pin(f(params))
    })
}

/// Portable exit outcome. `code` is `None` when the worker died on a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Executable {0} not found")]
    ExecutableNotFound(String),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker stdio pipes unavailable")]
    Pipes,
    #[error("rpc channel closed")]
    ChannelClosed,
    #[error("worker error: {0}")]
    Worker(String),
    #[error("supervisor was not spawned")]
    NotSpawned,
}

/// Cloneable outbound half of the channel. Usable before `spawn()`: frames
/// queue until the writer task attaches to the worker's stdin.
#[derive(Clone)]
pub struct RpcSender {
    writer: mpsc::UnboundedSender<String>,
    inflight: Arc<DashMap<u64, oneshot::Sender<Result<Value, String>>>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl RpcSender {
    /// Invoke a worker-side method and wait for its response.
    pub async fn send<M: Into<String>>(
        &self,
        method: M,
        params: Option<Value>,
    ) -> Result<Value, SupervisorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(id, tx);
        // the reader clears inflight when the channel dies; the flag covers a
        // send that lands after that sweep
        if self.closed.load(Ordering::SeqCst) {
            self.inflight.remove(&id);
            return Err(SupervisorError::ChannelClosed);
        }
        if self.writer.send(Frame::request(id, method, params).encode()).is_err() {
            self.inflight.remove(&id);
            return Err(SupervisorError::ChannelClosed);
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SupervisorError::Worker(message)),
            Err(_) => Err(SupervisorError::ChannelClosed),
        }
    }

    /// Fire-and-forget request; no inflight entry is kept.
    pub fn notify<M: Into<String>>(
        &self,
        method: M,
        params: Option<Value>,
    ) -> Result<(), SupervisorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.writer
            .send(Frame::request(id, method, params).encode())
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    fn respond(&self, frame: Frame) {
        let _ = self.writer.send(frame.encode());
    }
}

/// Cloneable kill switch, safe to hand into RPC handlers.
#[derive(Clone)]
pub struct KillHandle {
    kill_tx: mpsc::UnboundedSender<()>,
    violation: Arc<Mutex<Option<String>>>,
}

impl KillHandle {
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Record a protocol violation and kill the worker. The first recorded
    /// message wins; later ones are dropped.
    pub fn trip(&self, message: impl Into<String>) {
        let mut slot = self.violation.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message.into());
        }
        drop(slot);
        self.kill();
    }
}

/// Owns one worker process: spawn, RPC dispatch, stdout/stderr relays,
/// kill and exit reaping.
pub struct RunnerSupervisor {
    command: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    handlers: Arc<DashMap<String, RpcHandler>>,
    stdout_sink: Option<LineSink>,
    stderr_sink: Option<LineSink>,
    sender: RpcSender,
    writer_rx: Option<mpsc::UnboundedReceiver<String>>,
    kill_tx: mpsc::UnboundedSender<()>,
    kill_rx: Option<mpsc::UnboundedReceiver<()>>,
    violation: Arc<Mutex<Option<String>>>,
    exit_rx: Option<oneshot::Receiver<ProcessExit>>,
    stdout_done: Option<oneshot::Receiver<()>>,
    stderr_done: Option<oneshot::Receiver<()>>,
}

impl RunnerSupervisor {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        envs: HashMap<String, String>,
    ) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        Self {
            command: command.into(),
            args,
            envs,
            handlers: Arc::new(DashMap::new()),
            stdout_sink: None,
            stderr_sink: None,
            sender: RpcSender {
                writer: writer_tx,
                inflight: Arc::new(DashMap::new()),
                next_id: Arc::new(AtomicU64::new(1)),
                closed: Arc::new(AtomicBool::new(false)),
            },
            writer_rx: Some(writer_rx),
            kill_tx,
            kill_rx: Some(kill_rx),
            violation: Arc::new(Mutex::new(None)),
            exit_rx: None,
            stdout_done: None,
            stderr_done: None,
        }
    }

    /// Register a handler for an incoming method. Handlers registered before
    /// `spawn()` are guaranteed to see every frame the worker sends: the read
    /// loop only starts inside `spawn()`.
    pub fn handler(&self, method: impl Into<String>, f: RpcHandler) {
        self.handlers.insert(method.into(), f);
    }

    pub fn on_stdout(&mut self, sink: LineSink) {
        self.stdout_sink = Some(sink);
    }

    pub fn on_stderr(&mut self, sink: LineSink) {
        self.stderr_sink = Some(sink);
    }

    pub fn sender(&self) -> RpcSender {
        self.sender.clone()
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle { kill_tx: self.kill_tx.clone(), violation: self.violation.clone() }
    }

    /// Terminate the worker. Pending RPC calls resolve with
    /// `SupervisorError::ChannelClosed` once the pipes collapse.
    pub fn kill(&self) {
        self.kill_handle().kill();
    }

    /// Ask the worker to drain and exit.
    pub fn close(&self) -> Result<(), SupervisorError> {
        self.sender.notify(Method::Close.as_ref(), None)
    }

    /// The first protocol violation observed on this channel, if any.
    pub fn violation(&self) -> Option<String> {
        self.violation.lock().unwrap().clone()
    }

    /// Tear down handler registrations and release the worker's stdin.
    pub fn shutdown(&mut self) {
        self.handlers.clear();
        self.stdout_sink = None;
        self.stderr_sink = None;
        // dropping the writer receiver's sender side happens when self drops;
        // closing stdin early is the reaper's job via kill/EOF
    }

    /// Start the worker process. Resolves once the pipes are attached and the
    /// reader/writer/reaper tasks are running.
    pub async fn spawn(&mut self) -> Result<(), SupervisorError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SupervisorError::ExecutableNotFound(self.command.clone())
                } else {
                    SupervisorError::Spawn { command: self.command.clone(), source: e }
                }
            })?;

        let stdin = child.stdin.take().ok_or(SupervisorError::Pipes)?;
        let stdout = child.stdout.take().ok_or(SupervisorError::Pipes)?;
        let stderr = child.stderr.take().ok_or(SupervisorError::Pipes)?;

        // writer: queued frames -> worker stdin
        let mut writer_rx = self.writer_rx.take().ok_or(SupervisorError::NotSpawned)?;
        tokio::spawn(async move {
            let mut w = BufWriter::new(stdin);
            while let Some(line) = writer_rx.recv().await {
                if w.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if w.write_all(b"\n").await.is_err() || w.flush().await.is_err() {
                    break;
                }
            }
        });

        // reader: worker stdout -> handler dispatch | response routing | sink
        let handlers = Arc::clone(&self.handlers);
        let inflight = Arc::clone(&self.sender.inflight);
        let closed = Arc::clone(&self.sender.closed);
        let sender = self.sender.clone();
        let killer = self.kill_handle();
        let stdout_sink = self.stdout_sink.clone();
        let (stdout_done_tx, stdout_done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::decode(&line) {
                    Ok(Frame::Request { id, method, params }) => {
                        let handler = handlers.get(&method).map(|h| Arc::clone(h.value()));
                        match handler {
                            Some(h) => {
                                let frame = match h(params).await {
                                    Ok(value) => Frame::response_ok(id, value),
                                    Err(message) => Frame::response_err(id, message),
                                };
                                sender.respond(frame);
                            }
                            None => {
                                killer.trip(format!("unknown method `{method}`"));
                                break;
                            }
                        }
                    }
                    Ok(Frame::Response { id, result, error }) => {
                        if let Some((_, tx)) = inflight.remove(&id) {
                            let _ = tx.send(match error {
                                Some(message) => Err(message),
                                None => Ok(result.unwrap_or(Value::Null)),
                            });
                        } else {
                            debug!(id, "response without matching request");
                        }
                    }
                    Err(_) => {
                        if let Some(sink) = &stdout_sink {
                            sink(line);
                        }
                    }
                }
            }
            // wake anyone still waiting on a response
            closed.store(true, Ordering::SeqCst);
            inflight.clear();
            let _ = stdout_done_tx.send(());
        });

        // stderr: always plain text
        let stderr_sink = self.stderr_sink.clone();
        let (stderr_done_tx, stderr_done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sink) = &stderr_sink {
                    sink(line);
                }
            }
            let _ = stderr_done_tx.send(());
        });

        // reaper: sole owner of the Child; serves kill requests until exit
        let mut kill_rx = self.kill_rx.take().ok_or(SupervisorError::NotSpawned)?;
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        if exit_tx.send(ProcessExit { code }).is_err() {
                            warn!("worker exit went unobserved");
                        }
                        break;
                    }
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            }
        });

        self.exit_rx = Some(exit_rx);
        self.stdout_done = Some(stdout_done_rx);
        self.stderr_done = Some(stderr_done_rx);
        Ok(())
    }

    /// Wait for the worker to exit and return its outcome. Resolves only
    /// after both output pipes are drained, so frames a worker wrote just
    /// before exiting are always dispatched first. Callable once per spawn.
    pub async fn wait(&mut self) -> Result<ProcessExit, SupervisorError> {
        let rx = self.exit_rx.take().ok_or(SupervisorError::NotSpawned)?;
        let exit = rx.await.map_err(|_| SupervisorError::ChannelClosed)?;
        if let Some(done) = self.stdout_done.take() {
            let _ = done.await;
        }
        if let Some(done) = self.stderr_done.take() {
            let _ = done.await;
        }
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn sh(script: &str) -> RunnerSupervisor {
        RunnerSupervisor::new("sh", vec!["-c".into(), script.into()], HashMap::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_request_gets_handled_and_answered() {
        // worker sends one request, ignores the response, exits cleanly
        let mut sup = sh(
            r#"printf '%s\n' '{"type":"request","id":1,"method":"log","params":{"msg":"hi"}}'; exit 0"#,
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        sup.handler(
            Method::Log.as_ref(),
            handler_fn(move |params| {
                let seen = Arc::clone(&seen_in);
                async move {
                    assert_eq!(params.unwrap()["msg"], json!("hi"));
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );
        sup.spawn().await.unwrap();
        let exit = sup.wait().await.unwrap();
        assert!(exit.success());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(sup.violation().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_frame_stdout_reaches_the_sink() {
        let mut sup = sh(r#"echo plain text; printf '%s\n' '{"level":"info","msg":"json log"}'"#);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        sup.on_stdout(Arc::new(move |line| sink_lines.lock().unwrap().push(line)));
        sup.spawn().await.unwrap();
        assert!(sup.wait().await.unwrap().success());
        // tiny grace period: reader task drains after exit
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2, "{lines:?}");
        assert_eq!(lines[0], "plain text");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stderr_is_relayed() {
        let mut sup = sh("echo oops 1>&2; exit 3");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        sup.on_stderr(Arc::new(move |line| sink_lines.lock().unwrap().push(line)));
        sup.spawn().await.unwrap();
        let exit = sup.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(lines.lock().unwrap().as_slice(), &["oops".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_method_is_a_violation_and_kills_the_worker() {
        let mut sup = sh(
            r#"printf '%s\n' '{"type":"request","id":1,"method":"bogus"}'; sleep 30"#,
        );
        sup.spawn().await.unwrap();
        let exit = sup.wait().await.unwrap();
        assert!(!exit.success());
        let violation = sup.violation().unwrap();
        assert!(violation.contains("bogus"), "{violation}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_executable_is_reported_distinctly() {
        let mut sup = RunnerSupervisor::new(
            "definitely-not-a-real-runner",
            vec![],
            HashMap::new(),
        );
        match sup.spawn().await {
            Err(SupervisorError::ExecutableNotFound(cmd)) => {
                assert_eq!(cmd, "definitely-not-a-real-runner")
            }
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_terminates_a_stuck_worker() {
        let mut sup = sh("sleep 30");
        sup.spawn().await.unwrap();
        sup.kill();
        let exit = sup.wait().await.unwrap();
        assert!(!exit.success());
        assert_eq!(exit.code, None); // signal, not an exit code
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_send_resolves_when_worker_dies() {
        let mut sup = sh("sleep 30");
        sup.spawn().await.unwrap();
        let sender = sup.sender();
        sup.kill();
        let err = sender.send(Method::Close.as_ref(), None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ChannelClosed));
    }
}
