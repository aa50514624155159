//! Project Backup Tool
//!
//! Zips a project tree together with a database dump, uploads the parts to a
//! local or S3-compatible disk and keeps a bounded number of backups there.

// projectbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod reporter;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{BackupConfig, default_raw_config};
use reporter::TracingReporter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "projectbackup", version, about = "Back up a project and its database")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "BACKUP_CONFIG", default_value = "config.json", global = true)]
    config: PathBuf,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one backup now (default)
    Run,
    /// Write a starter configuration file
    Init,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run_app(cli).await {
        Ok(true) => {
            println!("✅ Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("❌ Backup finished, but some files could not be uploaded.");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the run was complete.
async fn run_app(cli: Cli) -> Result<bool> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Init => {
            write_default_config(&cli.config)?;
            println!("Wrote starter configuration to {}", cli.config.display());
            Ok(true)
        }
        Command::Run => {
            let config = BackupConfig::load_from_json(&cli.config).with_context(|| {
                format!(
                    "Failed to load application configuration from {}",
                    cli.config.display()
                )
            })?;

            let run = backup::run_backup_flow(&config, Arc::new(TracingReporter));
            tokio::select! {
                report = run => {
                    let report = report?;
                    tracing::info!(
                        target_dir = %report.target_dir,
                        parts = report.parts.len(),
                        uploaded = report.upload.uploaded.len(),
                        failed = report.upload.failed.len(),
                        pruned = ?report.pruned,
                        dump = ?report.dump.as_ref().map(|d| (&d.path, d.compressed)),
                        "backup summary"
                    );
                    Ok(report.is_complete())
                }
                _ = tokio::signal::ctrl_c() => {
                    anyhow::bail!("Interrupted, backup run aborted and temporary files removed")
                }
            }
        }
    }
}

fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite it", path.display());
    }
    let contents = serde_json::to_string_pretty(&default_raw_config())
        .context("Could not serialize the default configuration")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Could not create config file {}", path.display()))
}

/// Initialize tracing with appropriate verbosity
fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        })
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
