//! Composition root: builds the state backend, the registries, the executor
//! and the event manager from a project config, with explicit init/shutdown
//! boundaries instead of process-wide singletons.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::config::ProjectConfig;
use crate::event::Event;
use crate::event_manager::{EmitError, EventManager};
use crate::executor::StepExecutor;
use crate::loader::{self, LoadReport};
use crate::locked_data::LockedData;
use crate::logger::Logger;
use crate::runner::RunnerTable;
use crate::state::{self, StateStore};
use crate::streams::StreamRegistry;

pub struct Runtime {
    config: ProjectConfig,
    logger: Logger,
    locked: Arc<LockedData>,
    state: Arc<dyn StateStore>,
    streams: Arc<StreamRegistry>,
    executor: Arc<StepExecutor>,
    events: EventManager,
    runners: RunnerTable,
}

impl Runtime {
    pub async fn init(config: ProjectConfig, logger: Logger) -> Result<Self> {
        let locked = Arc::new(LockedData::new(config.external_topics.iter().cloned()));
        let state = state::from_config(&config.state).await?;
        let streams = Arc::new(StreamRegistry::new());
        let runners = RunnerTable::with_defaults(&config.runners_dir);

        let (queue, rx) = EventManager::channel();
        let executor = Arc::new(StepExecutor::new(
            runners.clone(),
            Arc::clone(&state),
            Arc::clone(&streams),
            queue.clone(),
            logger.clone(),
        ));
        let events = EventManager::start(queue, rx, Arc::clone(&locked), executor.clone());

        info!(state = state.name(), "runtime initialized");
        Ok(Self { config, logger, locked, state, streams, executor, events, runners })
    }

    /// Discover and register everything under the configured steps dir, then
    /// bring the declared streams live.
    pub async fn load_steps(&self) -> Result<LoadReport> {
        let report =
            loader::load_steps_dir(&self.config.steps_dir, &self.runners, &self.locked).await?;
        for decl in self.locked.get_streams() {
            self.streams.declare(decl)?;
        }
        Ok(report)
    }

    /// Emit from an external trigger: mints a fresh trace and schedules the
    /// subscribers. Returns the trace id.
    pub fn trigger_emit(&self, topic: &str, data: Value) -> Result<String, EmitError> {
        let event = Event::originate(topic, data, vec![], self.logger.clone());
        let trace = event.trace_id.clone();
        self.events.emit(event)?;
        Ok(trace)
    }

    /// Synchronous variant: resolves once every subscriber invocation has
    /// completed, with the subscriber count.
    pub async fn trigger_emit_and_wait(
        &self,
        topic: &str,
        data: Value,
    ) -> Result<(String, usize), EmitError> {
        let event = Event::originate(topic, data, vec![], self.logger.clone());
        let trace = event.trace_id.clone();
        let count = self.events.emit_and_wait(event).await?;
        Ok((trace, count))
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn locked_data(&self) -> &Arc<LockedData> {
        &self.locked
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// Stop accepting emissions and abort anything still running.
    pub async fn shutdown(self) {
        for invocation in self.executor.active_invocations() {
            self.executor.cancel(invocation);
        }
        info!("runtime shut down");
    }
}
