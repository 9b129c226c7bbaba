// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine error taxonomy.
//!
//! The coordinator reports claim conflicts and quota exhaustion through
//! [`crate::coordinator::ClaimOutcome`]; a worker turns them into errors of
//! its own poll cycle. Everything here is either handled inside a worker
//! loop or fatal to the caller.

use serde::{Deserialize, Serialize};

/// Kind of block observed on a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Soft,
    Hard,
    Challenge,
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Challenge => "challenge",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Network fault or timeout. Retried, never escalates recovery.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("{kind} block detected")]
    BlockDetected { kind: BlockKind },

    /// Expected control flow between workers, not a failure.
    #[error("opportunity {0} already claimed")]
    ClaimConflict(String),

    #[error("acquisition quota exhausted ({0} reached)")]
    QuotaExhausted(u32),

    /// The session can no longer be used; the worker retires.
    #[error("session fatal: {0}")]
    SessionFatal(String),

    /// A coordinator invariant was broken. Never expected in a correct build.
    #[error("coordinator corruption: {0}")]
    CoordinatorCorruption(String),

    /// Outcome reported for a claim that expired or never existed.
    #[error("stale claim token: {0}")]
    StaleClaim(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("driver error: {0}")]
    Driver(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the worker loop carries on polling after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_)
                | Self::BlockDetected { .. }
                | Self::ClaimConflict(_)
                | Self::QuotaExhausted(_)
        )
    }

    /// Whether this error ends the owning worker's life.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(self, Self::SessionFatal(_) | Self::CoordinatorCorruption(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
