use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use polystep::config::ProjectConfig;
use polystep::logger::init_tracing;
use polystep::runtime::Runtime;

#[derive(Parser)]
#[command(name = "polystep", about = "Polyglot step execution runtime", version)]
struct Cli {
    /// Project config file.
    #[arg(short, long, default_value = "polystep.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the project's steps and serve until interrupted.
    Run,
    /// Load the project's steps and print the topology report.
    Validate,
    /// Emit one event into the loaded topology.
    Emit {
        topic: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,
        /// Wait for every subscriber invocation to complete.
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        ProjectConfig::load(&cli.config)?
    } else {
        ProjectConfig::default()
    };
    let logger = init_tracing(&config.log)?;

    match cli.command {
        Commands::Run => {
            let runtime = Runtime::init(config, logger).await?;
            let report = runtime.load_steps().await?;
            info!(steps = report.steps.len(), "serving; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            runtime.shutdown().await;
        }
        Commands::Validate => {
            let runtime = Runtime::init(config, logger).await?;
            let report = runtime.load_steps().await?;
            print!("{}", runtime.locked_data().report());
            if !report.skipped.is_empty() {
                println!("skipped files:");
                for (path, reason) in &report.skipped {
                    println!("  {}: {reason}", path.display());
                }
            }
            runtime.shutdown().await;
        }
        Commands::Emit { topic, data, wait } => {
            let data: Value = serde_json::from_str(&data)?;
            let runtime = Runtime::init(config, logger).await?;
            runtime.load_steps().await?;
            if wait {
                let (trace, count) = runtime.trigger_emit_and_wait(&topic, data).await?;
                println!("trace {trace}: {count} subscriber(s) completed");
            } else {
                let trace = runtime.trigger_emit(&topic, data)?;
                println!("trace {trace}: scheduled");
                // give detached invocations a moment before the process ends
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            runtime.shutdown().await;
        }
    }
    Ok(())
}
