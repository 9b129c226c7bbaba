// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommand implementations for the Dropwatch binary.

pub mod config_cmd;
pub mod output;
pub mod run_cmd;
pub mod simulate;

use crate::events::EngineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Install the global tracing subscriber.
pub fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "dropwatch={default_level},dropwatch_runtime={default_level}"
        ))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print every engine event as one JSON line until the bus closes.
pub fn spawn_event_printer(mut rx: broadcast::Receiver<EngineEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => output::print_json_line(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Resolves on Ctrl-C. A failed handler install resolves never.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("interrupt received, shutting down");
}
