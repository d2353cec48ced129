//! Step discovery: walk the configured steps directory for `*.step.<ext>`
//! handler files and `*.stream.yaml` declarations, extract each step's
//! `config` record through the language runner's config-dump entry point,
//! and hand the parsed forms to the registry.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::locked_data::LockedData;
use crate::runner::RunnerTable;
use crate::step::{Step, StepConfig, StreamDecl};

#[derive(Debug, Default)]
pub struct LoadReport {
    pub steps: Vec<String>,
    pub streams: Vec<String>,
    /// Files that looked like steps but could not be loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

pub fn is_step_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| stem.ends_with(".step"))
        .unwrap_or(false)
}

pub fn is_stream_file(path: &Path) -> bool {
    let yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
    yaml && path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| stem.ends_with(".stream"))
        .unwrap_or(false)
}

/// All step and stream files under `dir`, recursively, in stable order.
pub fn find_project_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("reading steps dir {}", current.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_step_file(&path) || is_stream_file(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Parse the JSON config record a runner's config-dump prints.
pub fn parse_step_config(json: &str) -> Result<StepConfig, serde_json::Error> {
    serde_json::from_str(json)
}

/// Version stamp for a step file; changes whenever the file does.
fn file_version(path: &Path) -> String {
    let meta = std::fs::metadata(path).ok();
    let mtime = meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let len = meta.map(|m| m.len()).unwrap_or(0);
    format!("{mtime}-{len}")
}

async fn extract_config(runners: &RunnerTable, path: &Path) -> Result<StepConfig> {
    let runner = runners
        .for_path(path)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let (command, args) = runner.config_invocation(path);
    let output = Command::new(&command)
        .args(&args)
        .output()
        .await
        .with_context(|| format!("running {command} for {}", path.display()))?;
    if !output.status.success() {
        bail!(
            "config extraction failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_step_config(stdout.trim())
        .with_context(|| format!("parsing config of {}", path.display()))
}

/// Load every step and stream under `dir` into the registry, then run the
/// strict graph validation. Config errors surface here and never reach the
/// executor.
pub async fn load_steps_dir(
    dir: &Path,
    runners: &RunnerTable,
    locked: &LockedData,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    for path in find_project_files(dir)? {
        if is_stream_file(&path) {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let decl: StreamDecl = serde_yaml_bw::from_str(&raw)
                .with_context(|| format!("parsing stream declaration {}", path.display()))?;
            let name = decl.name.clone();
            locked.add_stream(decl)?;
            report.streams.push(name);
            continue;
        }

        match extract_config(runners, &path).await {
            Ok(config) => {
                let step = Step::new(path.clone(), file_version(&path), config);
                let name = step.name().to_string();
                locked.add_step(step)?;
                report.steps.push(name);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unloadable step");
                report.skipped.push((path, e.to_string()));
            }
        }
    }

    locked.validate_graph()?;
    info!(
        steps = report.steps.len(),
        streams = report.streams.len(),
        skipped = report.skipped.len(),
        "steps loaded"
    );
    Ok(report)
}
