//! The step registry: canonical set of loaded steps, their topic index, and
//! the declared streams.
//!
//! Readers (the event manager, the executor) load an immutable snapshot by
//! cheap atomic pointer; writers rebuild the snapshot under a small mutex and
//! publish it with one swap. Hot reloads therefore never block concurrent
//! dispatch, and an emit observes either the old or the new topology, never a
//! half-built one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::step::{Step, StreamDecl};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("step `{0}` is already registered")]
    DuplicateName(String),
    #[error("step `{0}` is not registered")]
    UnknownStep(String),
    #[error("step `{step}` declares an empty topic")]
    EmptyTopic { step: String },
    #[error("step `{step}` has a non-object {what} schema")]
    InvalidSchema { step: String, what: &'static str },
    #[error("stream `{0}` is already declared")]
    DuplicateStream(String),
    #[error("topics subscribed but never emitted: {0}")]
    OrphanTopics(String),
}

/// One immutable view of the registry.
#[derive(Debug, Default)]
pub struct Snapshot {
    steps: HashMap<String, Arc<Step>>,
    /// topic → names of *executable* subscribers, in registration order.
    topic_index: HashMap<String, Vec<String>>,
    streams: HashMap<String, StreamDecl>,
}

impl Snapshot {
    pub fn steps(&self) -> impl Iterator<Item = &Arc<Step>> {
        self.steps.values()
    }

    pub fn step(&self, name: &str) -> Option<&Arc<Step>> {
        self.steps.get(name)
    }

    pub fn subscribers(&self, topic: &str) -> Vec<Arc<Step>> {
        self.topic_index
            .get(topic)
            .map(|names| names.iter().filter_map(|n| self.steps.get(n).cloned()).collect())
            .unwrap_or_default()
    }

    fn clone_contents(&self) -> Snapshot {
        Snapshot {
            steps: self.steps.clone(),
            topic_index: self.topic_index.clone(),
            streams: self.streams.clone(),
        }
    }

    fn rebuild_index(&mut self) {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        let mut names: Vec<&String> = self.steps.keys().collect();
        names.sort();
        for name in names {
            let step = &self.steps[name];
            if !step.config.executable() {
                continue;
            }
            for topic in step.config.subscribe_topics() {
                index.entry(topic.clone()).or_default().push(name.clone());
            }
        }
        self.topic_index = index;
    }

    /// Topics somebody subscribes (virtually or not) that nobody emits and
    /// that are not designated as externally triggered.
    fn orphan_topics(&self, external: &HashSet<String>) -> BTreeSet<String> {
        let emitted: HashSet<&str> = self
            .steps
            .values()
            .flat_map(|s| s.config.emit_topics())
            .collect();
        self.steps
            .values()
            .flat_map(|s| s.config.subscribe_topics().iter())
            .filter(|t| !emitted.contains(t.as_str()) && !external.contains(*t))
            .cloned()
            .collect()
    }
}

pub struct LockedData {
    snapshot: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    external_topics: HashSet<String>,
}

impl LockedData {
    pub fn new(external_topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            snapshot: ArcSwap::new(Arc::new(Snapshot::default())),
            write_lock: Mutex::new(()),
            external_topics: external_topics.into_iter().collect(),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribers(&self, topic: &str) -> Vec<Arc<Step>> {
        self.snapshot.load().subscribers(topic)
    }

    pub fn step(&self, name: &str) -> Option<Arc<Step>> {
        self.snapshot.load().step(name).cloned()
    }

    pub fn get_streams(&self) -> Vec<StreamDecl> {
        let snap = self.snapshot.load();
        let mut streams: Vec<StreamDecl> = snap.streams.values().cloned().collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        streams
    }

    pub fn add_step(&self, step: Step) -> Result<(), RegistryError> {
        validate_step(&step)?;
        self.mutate(|snap| {
            let name = step.name().to_string();
            if snap.steps.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
            snap.steps.insert(name, Arc::new(step));
            Ok(())
        })
    }

    /// Replace a registered step with a new parsed form (hot reload).
    pub fn update_step(&self, step: Step) -> Result<(), RegistryError> {
        validate_step(&step)?;
        self.mutate(|snap| {
            let name = step.name().to_string();
            if !snap.steps.contains_key(&name) {
                return Err(RegistryError::UnknownStep(name));
            }
            snap.steps.insert(name, Arc::new(step));
            Ok(())
        })
    }

    pub fn remove_step(&self, name: &str) -> Result<(), RegistryError> {
        self.mutate(|snap| {
            snap.steps
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| RegistryError::UnknownStep(name.to_string()))
        })
    }

    pub fn add_stream(&self, decl: StreamDecl) -> Result<(), RegistryError> {
        self.mutate(|snap| {
            if snap.streams.contains_key(&decl.name) {
                return Err(RegistryError::DuplicateStream(decl.name.clone()));
            }
            snap.streams.insert(decl.name.clone(), decl);
            Ok(())
        })
    }

    /// Strict graph check for loaders: every subscribed topic must have an
    /// emitter or be designated external. Hot-reload mutations only warn.
    pub fn validate_graph(&self) -> Result<(), RegistryError> {
        let orphans = self.snapshot.load().orphan_topics(&self.external_topics);
        if orphans.is_empty() {
            Ok(())
        } else {
            let list: Vec<String> = orphans.into_iter().collect();
            Err(RegistryError::OrphanTopics(list.join(", ")))
        }
    }

    /// Printable topology report for operators.
    pub fn report(&self) -> String {
        let snap = self.snapshot.load();
        let mut out = String::new();

        let mut by_flow: BTreeMap<&str, Vec<&Arc<Step>>> = BTreeMap::new();
        for step in snap.steps.values() {
            if step.config.flows().is_empty() {
                by_flow.entry("(no flow)").or_default().push(step);
            }
            for flow in step.config.flows() {
                by_flow.entry(flow.as_str()).or_default().push(step);
            }
        }
        for (flow, mut steps) in by_flow {
            steps.sort_by_key(|s| s.name().to_string());
            out.push_str(&format!("flow {flow}\n"));
            for step in steps {
                out.push_str(&format!(
                    "  {} [{}] subscribes={:?} emits={:?}\n",
                    step.name(),
                    step.config.kind(),
                    step.config.subscribe_topics(),
                    step.config.emit_topics(),
                ));
            }
        }

        let orphans = snap.orphan_topics(&self.external_topics);
        if !orphans.is_empty() {
            out.push_str("orphan topics (subscribed, never emitted):\n");
            for topic in &orphans {
                out.push_str(&format!("  {topic}\n"));
            }
        }
        let unreachable: Vec<&str> = snap
            .steps
            .values()
            .filter(|s| {
                let subs = s.config.subscribe_topics();
                !subs.is_empty() && subs.iter().all(|t| orphans.contains(t))
            })
            .map(|s| s.name())
            .collect();
        if !unreachable.is_empty() {
            out.push_str(&format!("unreachable steps: {}\n", unreachable.join(", ")));
        }
        out
    }

    fn mutate<F>(&self, apply: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Snapshot) -> Result<(), RegistryError>,
    {
        let _guard = self.write_lock.lock().unwrap();
        let current = self.snapshot.load();
        let mut next = current.clone_contents();
        apply(&mut next)?;
        next.rebuild_index();

        let before: BTreeSet<String> = current.steps.keys().cloned().collect();
        let after: BTreeSet<String> = next.steps.keys().cloned().collect();
        for added in after.difference(&before) {
            info!(step = %added, "step registered");
        }
        for removed in before.difference(&after) {
            info!(step = %removed, "step removed");
        }
        let old_orphans = current.orphan_topics(&self.external_topics);
        let new_orphans = next.orphan_topics(&self.external_topics);
        for topic in new_orphans.difference(&old_orphans) {
            warn!(%topic, "topic is subscribed but has no emitter");
        }

        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

fn validate_step(step: &Step) -> Result<(), RegistryError> {
    let name = step.name().to_string();
    if step.config.subscribe_topics().iter().any(|t| t.is_empty())
        || step.config.emit_topics().iter().any(|t| t.is_empty())
    {
        return Err(RegistryError::EmptyTopic { step: name });
    }
    let schemas = match &step.config {
        crate::step::StepConfig::Api(c) => vec![("body", c.body_schema.as_ref())],
        crate::step::StepConfig::Event(c) => vec![("input", c.input_schema.as_ref())],
        _ => vec![],
    };
    for (what, schema) in schemas {
        if let Some(schema) = schema {
            if !schema.is_object() {
                return Err(RegistryError::InvalidSchema { step: name, what });
            }
        }
    }
    Ok(())
}
