use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

use crate::config::Config;
use crate::core::llm::Availability;
use crate::core::{Engine, RunOutcome};

#[derive(Parser)]
#[command(name = "codepulse")]
#[command(about = "Batch-analyze a repository's source files with an LLM and map how they depend on each other")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Target directory (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Clone a repository and run the analysis pipeline over it
    Analyze {
        /// Repository URL (https)
        url: String,
    },

    /// Show a repository record
    Status {
        /// Repository id or URL
        target: String,
    },

    /// List the analyzed files of a repository
    Files {
        /// Repository id
        id: String,
    },

    /// List the dependency edges of a repository
    Deps {
        /// Repository id
        id: String,
    },

    /// Ask a question about an analyzed repository
    Ask {
        /// Repository id
        id: String,

        /// Question text
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },

    /// Remove every stored record
    Clear,
}

impl Cli {
    pub async fn execute(self, engine: Engine) -> Result<()> {
        match self.command {
            Commands::Init { path, force } => init(path, force),
            Commands::Analyze { url } => {
                let outcome = engine.analyze(&url).await?;
                info!(
                    "Repository {} is {}",
                    outcome.repository().id,
                    outcome.repository().status
                );
                match outcome {
                    RunOutcome::Completed { repository, report } => print_json(&json!({
                        "outcome": "completed",
                        "repository": repository,
                        "report": report,
                    })),
                    RunOutcome::Skipped(repository) => print_json(&json!({
                        "outcome": "skipped",
                        "repository": repository,
                    })),
                    RunOutcome::AlreadyRunning(repository) => print_json(&json!({
                        "outcome": "already_running",
                        "repository": repository,
                    })),
                    RunOutcome::Failed { repository, reason } => {
                        print_json(&json!({
                            "outcome": "failed",
                            "repository": repository,
                            "reason": reason,
                        }))?;
                        bail!("analysis of {} failed", repository.url)
                    }
                }
            }
            Commands::Status { target } => print_json(&engine.resolve(&target).await?),
            Commands::Files { id } => print_json(&engine.list_files(&id).await?),
            Commands::Deps { id } => print_json(&engine.list_dependencies(&id).await?),
            Commands::Ask { id, query } => {
                match engine.ask(&id, &query.join(" ")).await? {
                    Availability::Available(answer) => println!("{}", answer),
                    Availability::Unavailable(reason) => {
                        bail!("AI engine is temporarily unavailable: {}", reason)
                    }
                }
                Ok(())
            }
            Commands::Clear => {
                engine.clear_records().await?;
                info!("Record store cleared");
                Ok(())
            }
        }
    }
}

fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let dir = path.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;

    let target = dir.join("Codepulse.toml");
    if target.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", target.display());
    }

    Config::default().save(&target)?;
    info!("📝 Wrote default configuration to {}", target.display());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
