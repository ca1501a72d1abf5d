//! Operator tooling for inference recordings.
//!
//! ## Commands
//!
//! - `inference-recorder config`
//! - `inference-recorder list [--json]`
//! - `inference-recorder show <FINGERPRINT>`
//! - `inference-recorder verify`
//! - `inference-recorder remove <FINGERPRINT>...`

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use inference_recorder_core::{ConfigLoader, RecorderConfig};

pub mod recordings_cmd;

#[derive(Debug, Parser)]
#[command(name = "inference-recorder", version, about = "Inspect and maintain inference recordings")]
pub struct Cli {
    /// Configuration file (defaults to ./inference-recorder.toml when present).
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Override the recording directory.
    #[arg(long = "dir", short = 'd', global = true)]
    pub dir: Option<PathBuf>,

    /// Override the suite partition.
    #[arg(long = "suite", short = 's', global = true)]
    pub suite: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the resolved configuration.
    Config,
    /// List stored recordings.
    List(recordings_cmd::ListArgs),
    /// Print one recording as JSON.
    Show(recordings_cmd::ShowArgs),
    /// Check every recording is readable and still keyed by its fingerprint.
    Verify,
    /// Delete recordings.
    Remove(recordings_cmd::RemoveArgs),
}

impl Cli {
    /// Loads configuration, then applies command-line overrides.
    pub fn resolve_config(&self) -> anyhow::Result<RecorderConfig> {
        let mut config = match &self.config {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::load_default(),
        }
        .context("failed to load recorder configuration")?;

        if let Some(dir) = &self.dir {
            config.recording_dir = dir.clone();
        }
        if let Some(suite) = &self.suite {
            config.suite = Some(suite.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let config = cli.resolve_config()?;
    tracing::debug!(mode = %config.mode, path = %config.store_dir().display(), "resolved configuration");
    match cli.command {
        Command::Config => recordings_cmd::print_config(&config, out),
        Command::List(args) => recordings_cmd::list(&config, &args, out),
        Command::Show(args) => recordings_cmd::show(&config, &args, out),
        Command::Verify => recordings_cmd::verify(&config, out),
        Command::Remove(args) => recordings_cmd::remove(&config, &args, out),
    }
}
