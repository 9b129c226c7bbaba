// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use dropwatch_runtime::cli;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dropwatch",
    about = "Dropwatch: parallel availability watcher with quota-bounded acquisition",
    version,
    after_help = "Run 'dropwatch <command> --help' for details on each command."
)]
struct Cli {
    /// Configuration file (defaults to ~/.dropwatch/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a live listing over HTTP
    Run {
        /// Listing URL to poll
        #[arg(long)]
        target: String,
        /// URL acquisitions are posted to
        #[arg(long)]
        acquire: String,
        /// Egress proxy; repeat for several. Identity rotation cycles them.
        #[arg(long = "proxy")]
        proxies: Vec<String>,
        /// Stream engine events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Replay a scripted scenario file
    Simulate {
        /// Scenario JSON file
        scenario: PathBuf,
        /// Stream engine events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Print the effective configuration
    Config,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if !matches!(cli.command, Commands::Completions { .. }) {
        cli::init_tracing(cli.verbose, cli.log_json);
    }
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run {
            target,
            acquire,
            proxies,
            events,
        } => {
            cli::run_cmd::run(cli::run_cmd::RunArgs {
                config_path,
                target: &target,
                acquire: &acquire,
                proxies,
                print_events: events,
            })
            .await
        }
        Commands::Simulate { scenario, events } => {
            cli::simulate::run(config_path, &scenario, events).await
        }
        Commands::Config => cli::config_cmd::run(config_path),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "dropwatch", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        eprintln!("  Error: {e:#}");
        std::process::exit(1);
    }

    result
}
