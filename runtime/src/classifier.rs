// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Detection classifier: raw poll result → detection state.
//!
//! Pure with respect to its inputs: the signal and the worker's count of
//! prior consecutive ambiguous empties. Signatures are compiled once.
//!
//! The soft-block rule (N ambiguous empties in a row) is a heuristic for
//! silent throttling. It can misfire both ways and is not ground truth.

use crate::config::{DetectionConfig, RecoveryConfig};
use crate::driver::{RawItem, RawSignal};
use crate::error::{BlockKind, EngineError, Result};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

/// Outcome of classifying one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Available(Vec<RawItem>),
    /// No items. `ambiguous` is set when the resource gave no
    /// authoritative "nothing available" indicator.
    Empty { ambiguous: bool },
    SoftBlock,
    HardBlock,
    Challenge,
    TransientError,
}

/// Payload-free view of a [`Detection`], for events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Available,
    Empty,
    SoftBlock,
    HardBlock,
    Challenge,
    TransientError,
}

impl Detection {
    pub fn kind(&self) -> DetectionKind {
        match self {
            Self::Available(_) => DetectionKind::Available,
            Self::Empty { .. } => DetectionKind::Empty,
            Self::SoftBlock => DetectionKind::SoftBlock,
            Self::HardBlock => DetectionKind::HardBlock,
            Self::Challenge => DetectionKind::Challenge,
            Self::TransientError => DetectionKind::TransientError,
        }
    }

    /// The block kind, if this detection escalates recovery.
    pub fn block(&self) -> Option<BlockKind> {
        match self {
            Self::SoftBlock => Some(BlockKind::Soft),
            Self::HardBlock => Some(BlockKind::Hard),
            Self::Challenge => Some(BlockKind::Challenge),
            _ => None,
        }
    }

    /// Next value of the rolling ambiguous-empty counter.
    ///
    /// Transient errors leave the counter alone; everything that is not an
    /// ambiguous empty breaks the run.
    pub fn next_empty_streak(&self, streak: u32) -> u32 {
        match self {
            Self::Empty { ambiguous: true } => streak.saturating_add(1),
            Self::TransientError => streak,
            _ => 0,
        }
    }
}

pub struct Classifier {
    hard_block_statuses: Vec<u16>,
    transient_statuses: Vec<u16>,
    hard_block: RegexSet,
    challenge: RegexSet,
    soft_block_threshold: u32,
}

fn compile(patterns: &[String], what: &str) -> Result<RegexSet> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|e| EngineError::Config(format!("invalid {what} signature: {e}")))
}

impl Classifier {
    pub fn new(detection: &DetectionConfig, recovery: &RecoveryConfig) -> Result<Self> {
        Ok(Self {
            hard_block_statuses: detection.hard_block_statuses.clone(),
            transient_statuses: detection.transient_statuses.clone(),
            hard_block: compile(&detection.hard_block_signatures, "hard-block")?,
            challenge: compile(&detection.challenge_signatures, "challenge")?,
            soft_block_threshold: recovery.soft_block_threshold.max(1),
        })
    }

    /// Classify a poll result.
    ///
    /// `empty_streak` is the number of consecutive ambiguous empties seen
    /// before this poll.
    pub fn classify(&self, signal: &RawSignal, empty_streak: u32) -> Detection {
        if signal.fault.is_some() {
            return Detection::TransientError;
        }
        let Some(status) = signal.status else {
            return Detection::TransientError;
        };
        if self.transient_statuses.contains(&status) {
            return Detection::TransientError;
        }

        if self.hard_block_statuses.contains(&status) || self.hard_block.is_match(&signal.body) {
            return Detection::HardBlock;
        }
        if self.challenge.is_match(&signal.body) {
            return Detection::Challenge;
        }

        if !signal.items.is_empty() {
            return Detection::Available(signal.items.clone());
        }

        if signal.empty_indicator == Some(true) {
            return Detection::Empty { ambiguous: false };
        }
        if empty_streak.saturating_add(1) >= self.soft_block_threshold {
            Detection::SoftBlock
        } else {
            Detection::Empty { ambiguous: true }
        }
    }
}
