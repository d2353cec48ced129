//! Topic dispatch. An emission is a message onto the manager's queue, never
//! a direct call into the executor: recursive emits from inside handlers
//! therefore cannot deadlock on anything the dispatcher holds.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::event::Event;
use crate::executor::StepError;
use crate::locked_data::LockedData;
use crate::step::Step;

/// Seam between dispatch and execution; the real implementation spawns a
/// worker process, tests substitute a recorder.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(&self, step: Arc<Step>, event: Event)
        -> Result<Option<serde_json::Value>, StepError>;
}

pub struct QueuedEmit {
    pub event: Event,
    /// Completion ack carrying the number of scheduled subscribers; present
    /// only for `emit_and_wait`.
    pub done: Option<oneshot::Sender<usize>>,
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("event manager is not running")]
    Closed,
}

/// Cheap handle for enqueueing emissions; this is what the executor hands to
/// worker `emit` RPC handlers.
#[derive(Clone)]
pub struct EmitQueue(mpsc::UnboundedSender<QueuedEmit>);

impl EmitQueue {
    /// Enqueue an event. Returns once the event is accepted; subscribers are
    /// scheduled by the dispatcher, not awaited.
    pub fn emit(&self, event: Event) -> Result<(), EmitError> {
        self.0.send(QueuedEmit { event, done: None }).map_err(|_| EmitError::Closed)
    }

    fn enqueue(&self, queued: QueuedEmit) -> Result<(), EmitError> {
        self.0.send(queued).map_err(|_| EmitError::Closed)
    }
}

pub struct EventManager {
    queue: EmitQueue,
}

impl EventManager {
    /// Create the dispatch queue ahead of time so the executor can be built
    /// before the manager starts.
    pub fn channel() -> (EmitQueue, mpsc::UnboundedReceiver<QueuedEmit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EmitQueue(tx), rx)
    }

    pub fn start(
        queue: EmitQueue,
        rx: mpsc::UnboundedReceiver<QueuedEmit>,
        locked: Arc<LockedData>,
        invoker: Arc<dyn StepInvoker>,
    ) -> Self {
        tokio::spawn(dispatch_loop(rx, locked, invoker));
        Self { queue }
    }

    pub fn queue(&self) -> EmitQueue {
        self.queue.clone()
    }

    /// Fan-out mode: schedule all subscribers and return.
    pub fn emit(&self, event: Event) -> Result<(), EmitError> {
        self.queue.emit(event)
    }

    /// Synchronous mode: resolves with the subscriber count once every
    /// invocation has completed, so state written by the sub-flow is visible
    /// on return.
    pub async fn emit_and_wait(&self, event: Event) -> Result<usize, EmitError> {
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(QueuedEmit { event, done: Some(tx) })?;
        rx.await.map_err(|_| EmitError::Closed)
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<QueuedEmit>,
    locked: Arc<LockedData>,
    invoker: Arc<dyn StepInvoker>,
) {
    // per-(step, trace) guards for steps that request serialized delivery
    let serial_guards: Arc<DashMap<(String, String), Arc<Mutex<()>>>> = Arc::new(DashMap::new());

    while let Some(queued) = rx.recv().await {
        let subscribers = locked.subscribers(&queued.event.topic);
        debug!(topic = %queued.event.topic, count = subscribers.len(), "dispatching event");

        let mut handles = Vec::with_capacity(subscribers.len());
        for step in subscribers {
            let event = queued.event.clone();
            let invoker = Arc::clone(&invoker);
            let guards = Arc::clone(&serial_guards);
            handles.push(tokio::spawn(async move {
                let guard = if step.config.serial() {
                    let key = (step.name().to_string(), event.trace_id.clone());
                    let mutex =
                        Arc::clone(&guards.entry(key.clone()).or_insert_with(Default::default));
                    let held = mutex.lock_owned().await;
                    Some((held, key, guards))
                } else {
                    None
                };

                // executor logs its own completion record; failures here do
                // not touch fan-out siblings
                let _ = invoker.invoke(step, event).await;

                if let Some((held, key, guards)) = guard {
                    drop(held);
                    guards.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
                }
            }));
        }

        if let Some(done) = queued.done {
            tokio::spawn(async move {
                let count = handles.len();
                for handle in handles {
                    let _ = handle.await;
                }
                let _ = done.send(count);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::logger::{Logger, TracingLogger};
    use crate::step::{EmitDecl, EventConfig, StepConfig};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingInvoker {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl StepInvoker for CountingInvoker {
        async fn invoke(&self, _step: Arc<Step>, _event: Event) -> Result<Option<Value>, StepError> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn step(name: &str, subscribes: &[&str]) -> Step {
        Step::new(
            format!("steps/{name}.step.py"),
            "1",
            StepConfig::Event(EventConfig {
                name: name.into(),
                subscribes: subscribes.iter().map(|s| s.to_string()).collect(),
                emits: vec![EmitDecl::Topic("out".into())],
                input_schema: None,
                flows: vec![],
                serial: false,
            }),
        )
    }

    fn test_event(topic: &str) -> Event {
        Event::new(topic, json!({"x": 1}), "T1", vec![], Logger(Box::new(TracingLogger::new())))
    }

    fn manager(locked: Arc<LockedData>, invoker: Arc<dyn StepInvoker>) -> EventManager {
        let (queue, rx) = EventManager::channel();
        EventManager::start(queue, rx, locked, invoker)
    }

    #[tokio::test]
    async fn fan_out_schedules_every_subscriber() {
        let locked = Arc::new(LockedData::new(["a".to_string()]));
        locked.add_step(step("s1", &["a"])).unwrap();
        locked.add_step(step("s2", &["a"])).unwrap();
        let invoker = Arc::new(CountingInvoker { calls: AtomicUsize::new(0), delay: None });
        let manager = manager(locked, invoker.clone());

        let scheduled = manager.emit_and_wait(test_event("a")).await.unwrap();
        assert_eq!(scheduled, 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn emit_returns_before_completion() {
        let locked = Arc::new(LockedData::new(["a".to_string()]));
        locked.add_step(step("slow", &["a"])).unwrap();
        let invoker = Arc::new(CountingInvoker {
            calls: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(200)),
        });
        let manager = manager(locked, invoker.clone());

        manager.emit(test_event("a")).unwrap();
        // scheduled, not yet finished
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribed_topic_invokes_nothing() {
        let locked = Arc::new(LockedData::new(["a".to_string()]));
        locked.add_step(step("s1", &["a"])).unwrap();
        let invoker = Arc::new(CountingInvoker { calls: AtomicUsize::new(0), delay: None });
        let manager = manager(locked, invoker.clone());

        let scheduled = manager.emit_and_wait(test_event("other")).await.unwrap();
        assert_eq!(scheduled, 0);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn removal_takes_effect_for_subsequent_emits() {
        let locked = Arc::new(LockedData::new(["a".to_string()]));
        locked.add_step(step("s1", &["a"])).unwrap();
        let invoker = Arc::new(CountingInvoker { calls: AtomicUsize::new(0), delay: None });
        let manager = manager(locked.clone(), invoker.clone());

        assert_eq!(manager.emit_and_wait(test_event("a")).await.unwrap(), 1);

        locked.remove_step("s1").unwrap();
        locked.add_step(step("s1b", &["b"])).unwrap();
        assert_eq!(manager.emit_and_wait(test_event("a")).await.unwrap(), 0);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_thousand_emits_schedule_a_thousand_invocations() {
        let locked = Arc::new(LockedData::new(["tick".to_string()]));
        locked.add_step(step("counter", &["tick"])).unwrap();
        let invoker = Arc::new(CountingInvoker { calls: AtomicUsize::new(0), delay: None });
        let manager = manager(locked, invoker.clone());

        for _ in 0..999 {
            manager.emit(test_event("tick")).unwrap();
        }
        // the last one synchronously: queue order means all prior deliveries
        // were scheduled first
        manager.emit_and_wait(test_event("tick")).await.unwrap();

        // drain stragglers
        tokio::time::timeout(Duration::from_secs(5), async {
            while invoker.calls.load(Ordering::SeqCst) < 1000 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("not all invocations were scheduled");
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1000);
    }
}
