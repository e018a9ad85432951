//! CLI module for coderun
//!
//! Provides commands:
//! - `serve`: start the server (default)
//! - `check`: configuration and runtime diagnostics
//! - `run`: one-shot local run of a source file
//! - `keygen`: mint an API key for static configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod check;
pub mod keygen;
pub mod run;

/// coderun interactive code execution server
#[derive(Parser, Debug)]
#[command(name = "coderun")]
#[command(about = "Interactive remote code execution over WebSocket")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default)
    Serve,
    /// Print the effective configuration and detected runtime
    Check,
    /// Compile and run a source file, relaying this terminal's stdin
    Run {
        /// Source file
        file: PathBuf,
        /// Language profile (inferred from the file extension when omitted)
        #[arg(short, long)]
        language: Option<String>,
    },
    /// Generate an API key and the hash to put in [server.auth] api_keys
    Keygen {
        /// User the key belongs to
        #[arg(short, long, default_value = "user")]
        user: String,
        /// Grant admin scope
        #[arg(long)]
        admin: bool,
        /// Append the key entry to this config file instead of printing it
        #[arg(long, value_name = "FILE")]
        append: Option<PathBuf>,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        None | Some(Commands::Serve) => crate::server::run().await,
        Some(Commands::Check) => check::run().await,
        Some(Commands::Run { file, language }) => run::run(&file, language).await,
        Some(Commands::Keygen {
            user,
            admin,
            append,
        }) => keygen::run(&user, admin, append.as_deref()),
    }
}
