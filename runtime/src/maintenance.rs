// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Background maintenance loop.
//!
//! Runs while the pool is active: releases overdue claims, purges stale
//! opportunities and watches for the whole pool sitting at recovery level 3.

use crate::events::EngineEvent;
use crate::worker::WorkerContext;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::watch;

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceStats {
    pub ticks: u64,
    pub expired_claims: usize,
    pub purged_opportunities: usize,
    pub degraded_transitions: u64,
}

/// Edge detector for pool-wide degradation.
#[derive(Debug, Default)]
pub struct DegradationWatch {
    degraded: bool,
}

impl DegradationWatch {
    /// `all_at_max` is the live worker count when every one of them is at
    /// level 3, `live` the current number of live workers.
    pub fn observe(&mut self, all_at_max: Option<usize>, live: usize) -> Option<EngineEvent> {
        match (self.degraded, all_at_max) {
            (false, Some(workers)) => {
                self.degraded = true;
                Some(EngineEvent::PoolDegraded { workers })
            }
            (true, None) if live > 0 => {
                self.degraded = false;
                Some(EngineEvent::PoolRecovered { workers: live })
            }
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Spawn the maintenance loop until `shutdown` flips to true.
pub fn spawn(
    ctx: WorkerContext,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<MaintenanceStats> {
    tokio::spawn(async move {
        let tick_every = ctx.config.maintenance_tick();
        let ttl = ctx.config.opportunity_ttl();
        tracing::debug!(
            "maintenance loop started: tick={}ms ttl={}s",
            tick_every.as_millis(),
            ttl.as_secs()
        );
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut watch = DegradationWatch::default();
        let mut stats = MaintenanceStats::default();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    stats.ticks = stats.ticks.saturating_add(1);
                    let (expired, purged) = ctx.coordinator.sweep(Instant::now(), ttl);
                    stats.expired_claims += expired;
                    stats.purged_opportunities += purged;
                    if purged > 0 {
                        tracing::debug!("maintenance purged {purged} stale opportunit(ies)");
                    }

                    if let Some(event) = watch.observe(ctx.board.all_at_max_level(), ctx.board.len()) {
                        match &event {
                            EngineEvent::PoolDegraded { workers } => {
                                stats.degraded_transitions += 1;
                                tracing::warn!("every live worker ({workers}) is at recovery level 3");
                            }
                            _ => tracing::info!("pool recovered from level 3"),
                        }
                        ctx.bus.emit(event);
                    }
                }
            }
        }
        tracing::debug!(
            "maintenance loop stopping: ticks={} expired_claims={} purged={}",
            stats.ticks,
            stats.expired_claims,
            stats.purged_opportunities
        );
        stats
    })
}
