// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Worker pool manager.
//!
//! Owns the worker tasks, replaces dead or aged-out workers and drives the
//! graceful shutdown. Workers never talk to the pool directly: they exit with
//! a [`WorkerExit`] and the pool decides what happens next.

use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, CoordinatorSnapshot};
use crate::driver::DriverFactory;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::ids::WorkerId;
use crate::maintenance::{self, MaintenanceStats};
use crate::opportunity::Scorer;
use crate::worker::{self, RetireReason, StopSignals, WorkerBoard, WorkerContext, WorkerExit};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};

/// Slack past a deadline before stragglers are aborted, so a worker that
/// gave up on its poll at the deadline still gets to close its session.
const ABORT_SLACK: Duration = Duration::from_millis(250);

/// Why [`WorkerPool::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    QuotaReached,
    /// Every worker is gone and the respawn budget is spent.
    WorkersExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub acquisitions: u32,
    pub max_acquisitions: u32,
    pub workers_spawned: u32,
    pub respawns: u32,
    pub elapsed_ms: u64,
    pub coordinator: CoordinatorSnapshot,
    pub maintenance: MaintenanceStats,
    pub exits: Vec<WorkerExit>,
}

#[derive(Debug)]
enum PoolCommand {
    Spawn,
    Retire(WorkerId),
    Replace(WorkerId),
}

/// Cloneable remote control for a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    shutdown: Arc<watch::Sender<bool>>,
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Ask every worker to stop and the pool to wind down.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn spawn(&self) -> bool {
        self.commands.send(PoolCommand::Spawn).is_ok()
    }

    pub fn retire(&self, worker_id: WorkerId) -> bool {
        self.commands.send(PoolCommand::Retire(worker_id)).is_ok()
    }

    pub fn replace(&self, worker_id: WorkerId) -> bool {
        self.commands.send(PoolCommand::Replace(worker_id)).is_ok()
    }
}

struct WorkerSlot {
    generation: u32,
    retire: watch::Sender<bool>,
    abort: AbortHandle,
}

pub struct WorkerPool {
    config: Arc<EngineConfig>,
    factory: Arc<dyn DriverFactory>,
    ctx: WorkerContext,
    shutdown: Arc<watch::Sender<bool>>,
    commands_tx: mpsc::UnboundedSender<PoolCommand>,
    commands_rx: mpsc::UnboundedReceiver<PoolCommand>,
    tasks: JoinSet<WorkerExit>,
    slots: HashMap<WorkerId, WorkerSlot>,
    replace_on_exit: HashSet<WorkerId>,
    next_id: u64,
    spawned: u32,
    respawns: u32,
    exits: Vec<WorkerExit>,
}

impl WorkerPool {
    /// Validate the config and build the shared services. No worker starts
    /// until [`spawn`](Self::spawn) or [`run`](Self::run).
    pub fn new(config: EngineConfig, factory: Arc<dyn DriverFactory>) -> Result<Self> {
        config.validate()?;
        let classifier = Classifier::new(&config.detection, &config.recovery)?;
        let bus = Arc::new(EventBus::new(config.event_capacity));
        let coordinator = Arc::new(Coordinator::new(
            Scorer::new(config.scoring.clone()),
            config.max_acquisitions,
            config.claim_timeout(),
            Arc::clone(&bus),
        ));
        let config = Arc::new(config);
        let ctx = WorkerContext {
            config: Arc::clone(&config),
            classifier: Arc::new(classifier),
            coordinator,
            bus,
            board: Arc::new(WorkerBoard::new()),
        };
        let (shutdown, _) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            factory,
            ctx,
            shutdown: Arc::new(shutdown),
            commands_tx,
            commands_rx,
            tasks: JoinSet::new(),
            slots: HashMap::new(),
            replace_on_exit: HashSet::new(),
            next_id: 0,
            spawned: 0,
            respawns: 0,
            exits: Vec::new(),
        })
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shutdown: Arc::clone(&self.shutdown),
            commands: self.commands_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.bus.subscribe()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.ctx.coordinator)
    }

    pub fn board(&self) -> Arc<WorkerBoard> {
        Arc::clone(&self.ctx.board)
    }

    /// Start one fresh worker.
    pub fn spawn(&mut self) -> WorkerId {
        self.spawn_generation(0)
    }

    fn spawn_generation(&mut self, generation: u32) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.spawned += 1;

        let (retire, retire_rx) = watch::channel(false);
        let stop = StopSignals {
            shutdown: self.shutdown.subscribe(),
            retire: retire_rx,
        };
        let inner = tokio::spawn(worker::launch(
            id,
            generation,
            Arc::clone(&self.factory),
            self.ctx.clone(),
            stop,
        ));
        let abort = inner.abort_handle();
        self.tasks.spawn(async move {
            match inner.await {
                Ok(exit) => exit,
                Err(e) if e.is_panic() => {
                    tracing::error!(worker = %id, "worker task panicked");
                    WorkerExit::without_session(id, generation, RetireReason::Crashed)
                }
                Err(_) => WorkerExit::without_session(id, generation, RetireReason::Aborted),
            }
        });
        self.slots.insert(
            id,
            WorkerSlot {
                generation,
                retire,
                abort,
            },
        );
        tracing::debug!(worker = %id, generation, "worker spawned");
        id
    }

    /// Ask a worker to stop after its current step. It is not replaced.
    pub fn retire(&mut self, worker_id: WorkerId) -> bool {
        match self.slots.get(&worker_id) {
            Some(slot) => {
                slot.retire.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Retire a worker and start a fresh one in its place once it exits.
    pub fn replace(&mut self, worker_id: WorkerId) -> bool {
        if self.retire(worker_id) {
            self.replace_on_exit.insert(worker_id);
            true
        } else {
            false
        }
    }

    fn apply(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Spawn => {
                self.spawn();
            }
            PoolCommand::Retire(id) => {
                if !self.retire(id) {
                    tracing::debug!(worker = %id, "retire ignored, no such worker");
                }
            }
            PoolCommand::Replace(id) => {
                if !self.replace(id) {
                    tracing::debug!(worker = %id, "replace ignored, no such worker");
                }
            }
        }
    }

    fn handle_exit(&mut self, joined: std::result::Result<WorkerExit, JoinError>, stopping: bool) {
        let exit = match joined {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!("worker supervisor failed: {e}");
                return;
            }
        };
        let id = exit.worker_id;
        let generation = self
            .slots
            .remove(&id)
            .map(|slot| slot.generation)
            .unwrap_or(exit.generation);
        let replace_requested = self.replace_on_exit.remove(&id);

        if matches!(exit.reason, RetireReason::Crashed | RetireReason::Aborted) {
            self.ctx.board.remove(id);
            self.ctx.bus.emit(EngineEvent::WorkerRetired {
                worker_id: id,
                reason: exit.reason,
                polls: exit.polls,
            });
        }

        if !stopping {
            if replace_requested || exit.reason.is_lifetime() {
                let next = self.spawn_generation(generation + 1);
                tracing::info!(worker = %id, replacement = %next, reason = ?exit.reason, "worker replaced");
            } else if exit.reason.is_death() {
                if self.respawns < self.config.max_respawns {
                    self.respawns += 1;
                    let next = self.spawn_generation(generation + 1);
                    tracing::info!(
                        worker = %id,
                        replacement = %next,
                        respawns = self.respawns,
                        reason = ?exit.reason,
                        "dead worker replaced"
                    );
                } else {
                    tracing::warn!(worker = %id, "respawn budget exhausted, not replacing");
                }
            }
        }
        self.exits.push(exit);
    }

    /// Fill the pool, supervise it until `shutdown` resolves, the handle
    /// requests a stop, the quota is reached or no worker is left, then shut
    /// everything down.
    pub async fn run<F>(mut self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        // Subscribe first: a fast worker can hit the quota before the loop starts.
        let mut events = self.ctx.bus.subscribe();
        while self.slots.len() < self.config.pool_size {
            self.spawn();
        }
        tracing::info!(
            workers = self.slots.len(),
            max_acquisitions = self.config.max_acquisitions,
            "pool started"
        );

        let maintenance = maintenance::spawn(self.ctx.clone(), self.shutdown.subscribe());
        let mut stop_rx = self.shutdown.subscribe();
        let stop_on_quota = self.config.stop_on_quota;
        tokio::pin!(shutdown);

        let stop_reason = loop {
            if *stop_rx.borrow() {
                break StopReason::Requested;
            }
            if stop_on_quota && self.ctx.coordinator.is_quota_exhausted() {
                break StopReason::QuotaReached;
            }
            if self.tasks.is_empty() {
                break StopReason::WorkersExhausted;
            }
            tokio::select! {
                _ = &mut shutdown => break StopReason::Requested,
                _ = stop_rx.changed() => {}
                Some(command) = self.commands_rx.recv() => self.apply(command),
                event = events.recv() => match event {
                    Ok(EngineEvent::QuotaReached { .. }) if stop_on_quota => {
                        break StopReason::QuotaReached;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "pool event receiver lagged");
                        if stop_on_quota && self.ctx.coordinator.is_quota_exhausted() {
                            break StopReason::QuotaReached;
                        }
                    }
                    _ => {}
                },
                Some(joined) = self.tasks.join_next() => self.handle_exit(joined, false),
            }
        };

        tracing::info!(reason = ?stop_reason, "pool stopping");
        self.stop_all().await;
        let maintenance = match maintenance.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("maintenance task failed: {e}");
                MaintenanceStats::default()
            }
        };

        let coordinator = self.ctx.coordinator.snapshot();
        self.ctx.bus.emit(EngineEvent::PoolStopped {
            acquisitions: coordinator.acquisitions,
            workers_spawned: self.spawned,
            respawns: self.respawns,
        });
        tracing::info!(
            acquisitions = coordinator.acquisitions,
            spawned = self.spawned,
            respawns = self.respawns,
            expired_claims = maintenance.expired_claims,
            purged = maintenance.purged_opportunities,
            degraded_transitions = maintenance.degraded_transitions,
            "pool stopped"
        );

        RunSummary {
            stop_reason,
            acquisitions: coordinator.acquisitions,
            max_acquisitions: coordinator.max_acquisitions,
            workers_spawned: self.spawned,
            respawns: self.respawns,
            elapsed_ms: started.elapsed().as_millis() as u64,
            coordinator,
            maintenance,
            exits: std::mem::take(&mut self.exits),
        }
    }

    /// Signal every worker and wait out the grace period. Workers that still
    /// hold a claim get until `act_timeout` to resolve it; anything else left
    /// running is aborted.
    async fn stop_all(&mut self) {
        self.shutdown.send_replace(true);
        let grace = tokio::time::Instant::now() + self.config.shutdown_grace() + ABORT_SLACK;
        if self.join_until(grace).await {
            return;
        }

        let holders = self.ctx.coordinator.claim_holders();
        let stragglers = self.abort_where(|id| !holders.contains(id));
        if stragglers > 0 {
            tracing::warn!(stragglers, "shutdown grace elapsed, aborting workers");
        }
        if !holders.is_empty() {
            tracing::info!(claims = holders.len(), "waiting for in-flight purchases");
            let deadline = tokio::time::Instant::now() + self.config.act_timeout() + ABORT_SLACK;
            if self.join_until(deadline).await {
                return;
            }
            let left = self.abort_where(|_| true);
            tracing::warn!(left, "purchases still unresolved, aborting");
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.handle_exit(joined, true);
        }
    }

    /// Collect exits until every task is done (`true`) or `deadline` passes.
    async fn join_until(&mut self, deadline: tokio::time::Instant) -> bool {
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.handle_exit(joined, true),
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    fn abort_where(&self, mut pick: impl FnMut(&WorkerId) -> bool) -> usize {
        let mut aborted = 0;
        for (id, slot) in &self.slots {
            if pick(id) {
                slot.abort.abort();
                aborted += 1;
            }
        }
        aborted
    }
}
