//! The `weft` server binary.
//!
//! # Quick Start
//!
//! ```bash
//! # Validate weft.toml / weft.local.toml in the current directory
//! weft check-config
//!
//! # Serve the built-in echo sessions on port 4000
//! weft serve --bind 4000
//! ```

mod commands;
mod echo;
mod signals;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use weft_reactor::ReactorKind;

/// Weft - a telnet-family text protocol server.
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run the server with line-echo sessions.
    Serve {
        /// Directory holding weft.toml (defaults to the current directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Replace the configured listeners (port only: 4000, or full: 127.0.0.1:4000).
        #[arg(short, long)]
        bind: Option<String>,

        /// Reactor backend (auto, epoll, kqueue, poll, emulated_completion, iocp).
        #[arg(short, long)]
        reactor: Option<ReactorKind>,
    },

    /// Load and validate the configuration, then print it.
    CheckConfig {
        /// Directory holding weft.toml (defaults to the current directory).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Serve {
            config,
            bind,
            reactor,
        } => commands::serve::run(config.as_deref(), bind.as_deref(), reactor),
        Commands::CheckConfig { config } => commands::check_config::run(config.as_deref()),
    }
}
