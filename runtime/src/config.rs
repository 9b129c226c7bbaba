// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Resolved once at startup (defaults, then an optional JSON file, then
//! `DROPWATCH_*` environment overrides) and shared read-only afterwards.

use crate::error::{EngineError, Result};
use crate::opportunity::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_MAX_ACQUISITIONS: u32 = 1;
const DEFAULT_MAX_RESPAWNS: u32 = 8;
const DEFAULT_MIN_WAIT_MS: u64 = 2_000;
const DEFAULT_MAX_WAIT_MS: u64 = 5_000;
const DEFAULT_BURST_WAIT_MS: u64 = 250;
const DEFAULT_BACKOFF_UNIT_MS: u64 = 1_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_ACT_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_OPPORTUNITY_TTL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
const DEFAULT_MAINTENANCE_TICK_MS: u64 = 1_000;
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Top-level options for one run of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of workers kept alive.
    pub pool_size: usize,
    /// Hard cap on successful acquisitions for the run.
    pub max_acquisitions: u32,
    /// Replacements allowed for workers that died.
    pub max_respawns: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    /// Target interval right after a positive detection.
    pub burst_wait_ms: u64,
    /// One backoff "time unit" for degraded workers.
    pub backoff_unit_ms: u64,
    pub poll_timeout_ms: u64,
    pub act_timeout_ms: u64,
    /// Claims not reported within this window are released.
    pub claim_timeout_ms: u64,
    pub opportunity_ttl_ms: u64,
    pub shutdown_grace_ms: u64,
    pub maintenance_tick_ms: u64,
    /// Retire a worker after this many polls.
    pub worker_max_polls: Option<u64>,
    /// Retire a worker after this much wall time.
    pub worker_max_lifetime_ms: Option<u64>,
    /// End the run once the quota is reached.
    pub stop_on_quota: bool,
    /// Fixed jitter seed for reproducible schedules.
    pub jitter_seed: Option<u64>,
    pub event_capacity: usize,
    pub recovery: RecoveryConfig,
    pub detection: DetectionConfig,
    pub scoring: ScoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_acquisitions: DEFAULT_MAX_ACQUISITIONS,
            max_respawns: DEFAULT_MAX_RESPAWNS,
            min_wait_ms: DEFAULT_MIN_WAIT_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            burst_wait_ms: DEFAULT_BURST_WAIT_MS,
            backoff_unit_ms: DEFAULT_BACKOFF_UNIT_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            act_timeout_ms: DEFAULT_ACT_TIMEOUT_MS,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            opportunity_ttl_ms: DEFAULT_OPPORTUNITY_TTL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            maintenance_tick_ms: DEFAULT_MAINTENANCE_TICK_MS,
            worker_max_polls: None,
            worker_max_lifetime_ms: None,
            stop_on_quota: true,
            jitter_seed: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            recovery: RecoveryConfig::default(),
            detection: DetectionConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

/// Thresholds for the per-worker recovery state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive ambiguous empties that count as a soft block.
    pub soft_block_threshold: u32,
    /// Consecutive clean polls that reset the recovery level.
    pub healthy_streak: u32,
    /// Level-3 escalations tolerated before the worker is declared dead.
    pub max_level3_escalations: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            soft_block_threshold: 5,
            healthy_streak: 3,
            max_level3_escalations: 10,
        }
    }
}

/// Signatures the classifier matches raw poll results against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub hard_block_statuses: Vec<u16>,
    pub transient_statuses: Vec<u16>,
    /// Case-insensitive regexes for terminal error pages.
    pub hard_block_signatures: Vec<String>,
    /// Case-insensitive regexes for interactive verification pages.
    pub challenge_signatures: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            hard_block_statuses: vec![403, 429],
            transient_statuses: vec![500, 502, 503, 504],
            hard_block_signatures: vec![
                r"access denied".to_string(),
                r"you have been blocked".to_string(),
                r"request (was )?rejected".to_string(),
            ],
            challenge_signatures: vec![
                r"captcha".to_string(),
                r"verify (that )?you are (a )?human".to_string(),
                r"checking your browser".to_string(),
            ],
        }
    }
}

/// Weights of the opportunity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub category_weights: CategoryWeights,
    /// Weight of the `reference / (reference + price)` term.
    pub inverse_price: f64,
    pub price_reference: f64,
    /// Weight of the `1 / (1 + position)` term.
    pub position: f64,
    /// Weight of the 0..=1 quality attribute.
    pub quality: f64,
    /// Lower-cased category hint → category.
    pub category_aliases: BTreeMap<String, Category>,
    /// Attribute keys dropped before hashing.
    pub volatile_keys: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let category_aliases = [
            ("premium", Category::Premium),
            ("vip", Category::Premium),
            ("gold", Category::Premium),
            ("standard", Category::Standard),
            ("regular", Category::Standard),
            ("general", Category::Standard),
            ("economy", Category::Economy),
            ("basic", Category::Economy),
            ("budget", Category::Economy),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            category_weights: CategoryWeights::default(),
            inverse_price: 1.0,
            price_reference: 100.0,
            position: 0.5,
            quality: 0.5,
            category_aliases,
            volatile_keys: ["timestamp", "ts", "fetched_at", "updated_at", "nonce", "request_id"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryWeights {
    pub premium: f64,
    pub standard: f64,
    pub economy: f64,
    pub unknown: f64,
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self {
            premium: 3.0,
            standard: 2.0,
            economy: 1.0,
            unknown: 0.0,
        }
    }
}

impl CategoryWeights {
    pub fn weight(&self, category: Category) -> f64 {
        match category {
            Category::Premium => self.premium,
            Category::Standard => self.standard,
            Category::Economy => self.economy,
            Category::Unknown => self.unknown,
        }
    }
}

impl EngineConfig {
    /// Default config file location (`~/.dropwatch/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dropwatch")
            .join("config.json")
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Full resolution: file (if any) → environment → validation.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DROPWATCH_*` overrides.
    pub fn apply_env(&mut self) {
        self.pool_size = read_env_usize("DROPWATCH_POOL_SIZE", self.pool_size);
        self.max_acquisitions = read_env_u32("DROPWATCH_MAX_ACQUISITIONS", self.max_acquisitions);
        self.max_respawns = read_env_u32("DROPWATCH_MAX_RESPAWNS", self.max_respawns);
        self.min_wait_ms = read_env_u64("DROPWATCH_MIN_WAIT_MS", self.min_wait_ms);
        self.max_wait_ms = read_env_u64("DROPWATCH_MAX_WAIT_MS", self.max_wait_ms);
        self.claim_timeout_ms = read_env_u64("DROPWATCH_CLAIM_TIMEOUT_MS", self.claim_timeout_ms);
        if let Some(seed) = read_env_string("DROPWATCH_JITTER_SEED").and_then(|v| v.parse().ok()) {
            self.jitter_seed = Some(seed);
        }
    }

    /// Reject option combinations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool_size must be at least 1".into()));
        }
        if self.max_acquisitions == 0 {
            return Err(EngineError::Config(
                "max_acquisitions must be at least 1".into(),
            ));
        }
        if self.min_wait_ms == 0 || self.min_wait_ms > self.max_wait_ms {
            return Err(EngineError::Config(format!(
                "wait window invalid: min_wait_ms={} max_wait_ms={}",
                self.min_wait_ms, self.max_wait_ms
            )));
        }
        if self.backoff_unit_ms == 0 {
            return Err(EngineError::Config("backoff_unit_ms must be positive".into()));
        }
        if self.act_timeout_ms >= self.claim_timeout_ms {
            return Err(EngineError::Config(format!(
                "act_timeout_ms ({}) must be shorter than claim_timeout_ms ({})",
                self.act_timeout_ms, self.claim_timeout_ms
            )));
        }
        if self.recovery.soft_block_threshold == 0 {
            return Err(EngineError::Config(
                "recovery.soft_block_threshold must be at least 1".into(),
            ));
        }
        if self.recovery.max_level3_escalations == 0 {
            return Err(EngineError::Config(
                "recovery.max_level3_escalations must be at least 1".into(),
            ));
        }
        if self.scoring.price_reference <= 0.0 {
            return Err(EngineError::Config(
                "scoring.price_reference must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn burst_wait(&self) -> Duration {
        Duration::from_millis(self.burst_wait_ms)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn act_timeout(&self) -> Duration {
        Duration::from_millis(self.act_timeout_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn opportunity_ttl(&self) -> Duration {
        Duration::from_millis(self.opportunity_ttl_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn maintenance_tick(&self) -> Duration {
        Duration::from_millis(self.maintenance_tick_ms.max(10))
    }

    pub fn worker_max_lifetime(&self) -> Option<Duration> {
        self.worker_max_lifetime_ms.map(Duration::from_millis)
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.recovery.soft_block_threshold, 5);
        assert_eq!(config.recovery.max_level3_escalations, 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "pool_size": 2, "max_acquisitions": 3, "recovery": {{ "healthy_streak": 7 }} }}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_acquisitions, 3);
        assert_eq!(config.recovery.healthy_streak, 7);
        assert_eq!(config.recovery.soft_block_threshold, 5);
        assert_eq!(config.min_wait_ms, DEFAULT_MIN_WAIT_MS);
    }

    #[test]
    fn test_category_alias_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "scoring": {{ "category_aliases": {{ "front row": "premium" }} }} }}"#
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.scoring.category_aliases.get("front row"),
            Some(&Category::Premium)
        );
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut config = EngineConfig {
            min_wait_ms: 5_000,
            max_wait_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        config.min_wait_ms = 500;
        config.act_timeout_ms = config.claim_timeout_ms;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let config = EngineConfig {
            max_acquisitions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            EngineConfig::load(Some(&missing)),
            Err(EngineError::Io(_))
        ));
    }

    #[test]
    fn test_duration_accessors() {
        let config = EngineConfig::default();
        assert_eq!(config.min_wait(), Duration::from_secs(2));
        assert_eq!(config.claim_timeout(), Duration::from_secs(30));
        assert!(config.worker_max_lifetime().is_none());
    }
}
