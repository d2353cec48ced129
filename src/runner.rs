use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::executor::StepError;

/// How to start a worker for one source language: the runtime executable,
/// its flags, the runner entry point that loads the step file and brokers
/// RPC, and the config-dump entry point used at discovery time.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub runner_file: PathBuf,
    pub config_file: PathBuf,
}

impl RunnerSpec {
    /// Handler invocation argv: `command args… runnerFile stepFile envelope`.
    pub fn invocation(&self, step_file: &Path, envelope_json: &str) -> (String, Vec<String>) {
        let mut args = self.args.clone();
        args.push(self.runner_file.to_string_lossy().into_owned());
        args.push(step_file.to_string_lossy().into_owned());
        args.push(envelope_json.to_string());
        (self.command.clone(), args)
    }

    /// Config extraction argv: `command args… configFile stepFile`; the
    /// process prints the step's config record as JSON and exits.
    pub fn config_invocation(&self, step_file: &Path) -> (String, Vec<String>) {
        let mut args = self.args.clone();
        args.push(self.config_file.to_string_lossy().into_owned());
        args.push(step_file.to_string_lossy().into_owned());
        (self.command.clone(), args)
    }
}

/// Extension → runner mapping. The defaults cover the supported languages;
/// hosts and tests may register additional entries.
#[derive(Debug, Clone)]
pub struct RunnerTable {
    by_ext: HashMap<String, RunnerSpec>,
}

impl RunnerTable {
    pub fn empty() -> Self {
        Self { by_ext: HashMap::new() }
    }

    pub fn with_defaults(runners_dir: &Path) -> Self {
        let mut table = Self::empty();
        table.register(
            "py",
            RunnerSpec {
                command: "python3".into(),
                args: vec![],
                runner_file: runners_dir.join("runner.py"),
                config_file: runners_dir.join("get_config.py"),
            },
        );
        table.register(
            "rb",
            RunnerSpec {
                command: "ruby".into(),
                args: vec![],
                runner_file: runners_dir.join("runner.rb"),
                config_file: runners_dir.join("get_config.rb"),
            },
        );
        table.register(
            "js",
            RunnerSpec {
                command: "node".into(),
                args: vec![],
                runner_file: runners_dir.join("runner.js"),
                config_file: runners_dir.join("get_config.js"),
            },
        );
        // TypeScript goes through node with a source-transform pre-loader
        table.register(
            "ts",
            RunnerSpec {
                command: "node".into(),
                args: vec!["--import".into(), "tsx".into()],
                runner_file: runners_dir.join("runner.js"),
                config_file: runners_dir.join("get_config.js"),
            },
        );
        table
    }

    pub fn register(&mut self, ext: impl Into<String>, spec: RunnerSpec) {
        self.by_ext.insert(ext.into(), spec);
    }

    pub fn for_path(&self, path: &Path) -> Result<&RunnerSpec, StepError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        self.by_ext
            .get(ext)
            .ok_or_else(|| StepError::UnsupportedExtension(ext.to_string()))
    }
}
