// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Run the pool against a live HTTP listing.

use crate::cli::{self, output};
use crate::config::EngineConfig;
use crate::driver::http::{HttpDriverConfig, HttpDriverFactory};
use crate::pool::WorkerPool;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct RunArgs<'a> {
    pub config_path: Option<&'a Path>,
    pub target: &'a str,
    pub acquire: &'a str,
    pub proxies: Vec<String>,
    pub print_events: bool,
}

pub async fn run(args: RunArgs<'_>) -> Result<()> {
    let config = EngineConfig::load(args.config_path).context("failed to load configuration")?;

    let mut http = HttpDriverConfig::new(args.target, args.acquire)?;
    http.timeout = config.poll_timeout();
    http.proxies = args.proxies;
    let factory = Arc::new(HttpDriverFactory::new(http));

    info!(
        "starting dropwatch v{} against {}",
        env!("CARGO_PKG_VERSION"),
        args.target
    );
    let pool = WorkerPool::new(config, factory).context("failed to build worker pool")?;
    let printer = args
        .print_events
        .then(|| cli::spawn_event_printer(pool.subscribe()));

    let summary = pool.run(cli::ctrl_c()).await;
    if let Some(printer) = printer {
        printer.abort();
    }
    output::print_json(&summary);
    Ok(())
}
