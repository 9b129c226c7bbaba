// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Print the effective configuration.

use crate::cli::output;
use crate::config::EngineConfig;
use anyhow::{Context, Result};
use std::path::Path;

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::load(config_path).context("failed to load configuration")?;
    output::print_json(&config);
    Ok(())
}
