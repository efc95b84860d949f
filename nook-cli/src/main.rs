//! Nook command-line front end
//!
//! Stands in for the form UI: every command calls one storage operation and
//! prints the result as JSON, or the failure as a single line on stderr.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use nook_core::{Config, Nook};

use commands::Command;

#[derive(Debug, Parser)]
#[command(name = "nook", version, about = "Local versioned document store")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding nook.db (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.database_path = dir.join("nook.db");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    nook_core::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    let nook = Nook::new(config)?;

    let output = commands::execute(&nook, cli.command).await;
    nook.shutdown().await;

    if let Some(value) = output? {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
