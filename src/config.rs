use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::logger::LogConfig;

/// Project-level configuration, read from a YAML file at the project root.
/// A `.env` next to it is loaded first so secrets stay out of the file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory scanned for `*.step.<ext>` and `*.stream.yaml` files.
    pub steps_dir: PathBuf,
    /// Directory holding the per-language runner entry points.
    pub runners_dir: PathBuf,
    /// Topics fed by outside triggers; subscribing them is valid even though
    /// no loaded step emits them.
    pub external_topics: Vec<String>,
    pub state: StateBackendConfig,
    pub log: LogConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            steps_dir: PathBuf::from("steps"),
            runners_dir: PathBuf::from("runners"),
            external_topics: Vec::new(),
            state: StateBackendConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let env_file = path.with_file_name(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("loaded environment from {}", env_file.display());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: ProjectConfig = serde_yaml_bw::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;

        if config.state.password.is_none() {
            config.state.password = std::env::var("POLYSTEP_STATE_PASSWORD").ok();
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateAdapter {
    #[default]
    Memory,
    File,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(default)]
pub struct StateBackendConfig {
    pub adapter: StateAdapter,
    /// File adapter only.
    pub path: Option<PathBuf>,
    /// Remote adapter only.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub db: Option<i64>,
    /// Seconds; memory and remote adapters only.
    pub ttl: Option<u64>,
}

impl StateBackendConfig {
    pub fn ttl_duration(&self) -> Option<Duration> {
        self.ttl.map(Duration::from_secs)
    }
}
