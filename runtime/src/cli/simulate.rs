// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Replay a scripted scenario through the real pool.
//!
//! A scenario file is JSON:
//!
//! ```json
//! {
//!   "config": { "pool_size": 2, "min_wait_ms": 10, "max_wait_ms": 20 },
//!   "workers": [ { "polls": [ { "status": 200, "items": [ { "label": "A1" } ] } ] } ],
//!   "fallback": { "then": { "status": 200, "empty_indicator": true } },
//!   "duration_ms": 5000
//! }
//! ```
//!
//! `workers` scripts are handed out in spawn order, replacements included;
//! once they run out every new session plays `fallback`.

use crate::cli::{self, output};
use crate::config::EngineConfig;
use crate::driver::scripted::{Script, ScriptedFactory};
use crate::pool::WorkerPool;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: Option<String>,
    /// Replaces the loaded configuration when present.
    pub config: Option<EngineConfig>,
    pub workers: Vec<Script>,
    pub fallback: Script,
    /// Stop the run after this long.
    pub duration_ms: Option<u64>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid scenario {}", path.display()))
    }

    /// Build a pool over scripted sessions. `base` is used unless the
    /// scenario carries its own config.
    pub fn into_pool(self, base: EngineConfig) -> Result<(WorkerPool, Arc<ScriptedFactory>)> {
        let mut config = self.config.unwrap_or(base);
        config.apply_env();
        let factory = Arc::new(ScriptedFactory::new(self.workers, self.fallback));
        let pool = WorkerPool::new(config, factory.clone()).context("failed to build worker pool")?;
        Ok((pool, factory))
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Resolves on `interrupt` or once `limit` has elapsed.
pub async fn stop_after<F>(limit: Option<Duration>, interrupt: F)
where
    F: Future<Output = ()>,
{
    match limit {
        Some(limit) => {
            tokio::select! {
                _ = interrupt => {}
                _ = tokio::time::sleep(limit) => {
                    tracing::info!("scenario time limit reached");
                }
            }
        }
        None => interrupt.await,
    }
}

pub async fn run(config_path: Option<&Path>, scenario_path: &Path, print_events: bool) -> Result<()> {
    let scenario = Scenario::from_file(scenario_path)?;
    let base = EngineConfig::load(config_path).context("failed to load configuration")?;
    if let Some(name) = &scenario.name {
        tracing::info!("simulating scenario '{name}'");
    }

    let limit = scenario.time_limit();
    let (pool, _factory) = scenario.into_pool(base)?;
    let printer = print_events.then(|| cli::spawn_event_printer(pool.subscribe()));

    let summary = pool.run(stop_after(limit, cli::ctrl_c())).await;
    if let Some(printer) = printer {
        printer.abort();
    }
    output::print_json(&summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scenario_file_parses_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "quota",
                "config": {{ "pool_size": 2, "min_wait_ms": 5, "max_wait_ms": 10 }},
                "workers": [ {{ "polls": [ {{ "status": 200, "items": [ {{ "label": "A1" }} ] }} ] }} ],
                "duration_ms": 100
            }}"#
        )
        .unwrap();

        let scenario = Scenario::from_file(file.path()).unwrap();
        assert_eq!(scenario.name.as_deref(), Some("quota"));
        assert_eq!(scenario.workers.len(), 1);
        assert_eq!(scenario.workers[0].polls[0].items[0].label, "A1");
        let config = scenario.config.as_ref().unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_acquisitions, 1);
        assert_eq!(scenario.time_limit(), Some(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_stop_after_limit() {
        let started = std::time::Instant::now();
        stop_after(Some(Duration::from_millis(20)), std::future::pending()).await;
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
