// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dropwatch event bus: typed events from every component.
//!
//! The EventBus is a `tokio::sync::broadcast` channel that carries
//! [`EngineEvent`] values. Any consumer (notifier, log sink, dashboard) can
//! subscribe independently. When no subscribers exist, events are silently
//! dropped.

use crate::classifier::DetectionKind;
use crate::error::BlockKind;
use crate::ids::{ClaimToken, OpportunityId, WorkerId};
use crate::opportunity::Category;
use crate::recovery::RecoveryLevel;
use crate::worker::{RetireReason, WorkerHealth};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the engine emits. Serialized to JSON for external consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    // ── Worker Events ─────────────────────
    /// A worker opened its session and started polling.
    WorkerSpawned { worker_id: WorkerId, generation: u32 },
    /// Health or recovery level changed.
    WorkerStateChanged {
        worker_id: WorkerId,
        from: WorkerHealth,
        to: WorkerHealth,
        level: RecoveryLevel,
        detection: Option<DetectionKind>,
        block: Option<BlockKind>,
    },
    /// A worker stopped for good.
    WorkerRetired {
        worker_id: WorkerId,
        reason: RetireReason,
        polls: u64,
    },

    // ── Opportunity Events ────────────────
    OpportunityDiscovered {
        opportunity_id: OpportunityId,
        worker_id: WorkerId,
        category: Category,
        label: String,
        price: Option<f64>,
        score: f64,
    },
    /// A material attribute changed on a tracked opportunity.
    OpportunityRescored {
        opportunity_id: OpportunityId,
        old_score: f64,
        new_score: f64,
        price: Option<f64>,
    },

    // ── Purchase Events ───────────────────
    PurchaseAttempted {
        opportunity_id: OpportunityId,
        worker_id: WorkerId,
        claim_token: ClaimToken,
    },
    PurchaseSucceeded {
        opportunity_id: OpportunityId,
        worker_id: WorkerId,
        acquisitions: u32,
        elapsed_ms: u64,
    },
    PurchaseFailed {
        opportunity_id: OpportunityId,
        worker_id: WorkerId,
        reason: String,
    },
    /// A claim was never reported and has been released.
    ClaimExpired {
        opportunity_id: OpportunityId,
        worker_id: WorkerId,
    },

    // ── Pool Events ───────────────────────
    /// Every live worker sits at recovery level 3.
    PoolDegraded { workers: usize },
    /// At least one worker is below level 3 again.
    PoolRecovered { workers: usize },
    /// The acquisition cap has been reached. A normal completion.
    QuotaReached { acquisitions: u32 },
    PoolStopped {
        acquisitions: u32,
        workers_spawned: u32,
        respawns: u32,
    },
}

impl EngineEvent {
    /// Stable name of the variant, for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerSpawned { .. } => "worker_spawned",
            Self::WorkerStateChanged { .. } => "worker_state_changed",
            Self::WorkerRetired { .. } => "worker_retired",
            Self::OpportunityDiscovered { .. } => "opportunity_discovered",
            Self::OpportunityRescored { .. } => "opportunity_rescored",
            Self::PurchaseAttempted { .. } => "purchase_attempted",
            Self::PurchaseSucceeded { .. } => "purchase_succeeded",
            Self::PurchaseFailed { .. } => "purchase_failed",
            Self::ClaimExpired { .. } => "claim_expired",
            Self::PoolDegraded { .. } => "pool_degraded",
            Self::PoolRecovered { .. } => "pool_recovered",
            Self::QuotaReached { .. } => "quota_reached",
            Self::PoolStopped { .. } => "pool_stopped",
        }
    }
}

/// The central event bus.
///
/// All components emit events through this bus. Consumers subscribe
/// to receive a stream of all events.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "emit");
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
