// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! One polling worker: poll → classify → recover → claim → act.
//!
//! A worker owns its session driver, its recovery state and its scheduler.
//! Everything shared goes through the [`Coordinator`]; the [`WorkerBoard`]
//! only mirrors each worker's status for observers.

use crate::classifier::{Classifier, Detection, DetectionKind};
use crate::config::EngineConfig;
use crate::coordinator::{ClaimOutcome, Coordinator, Resolution};
use crate::driver::{Action, DriverFactory, RawItem, RawSignal, SessionDriver, TransportFault};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::ids::WorkerId;
use crate::recovery::{RecoveryAction, RecoveryController, RecoveryDecision, RecoveryLevel};
use crate::scheduler::{ScheduleWindows, Scheduler};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    /// Recovery level above zero.
    Degraded,
    Dead,
}

impl WorkerHealth {
    fn for_level(level: RecoveryLevel) -> Self {
        if level.is_healthy() {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Pool-wide shutdown.
    Shutdown,
    /// Retired on request.
    Retired,
    QuotaReached,
    MaxPolls,
    LifetimeExceeded,
    /// Too many level-3 escalations.
    EscalationLimit,
    /// The driver refused or failed a recovery step.
    SessionFatal,
    OpenFailed,
    /// An engine invariant broke under this worker.
    Fault,
    /// The task panicked.
    Crashed,
    /// Did not stop within the shutdown grace period.
    Aborted,
}

impl RetireReason {
    /// The worker died and its replacement consumes the respawn budget.
    pub fn is_death(self) -> bool {
        matches!(
            self,
            Self::EscalationLimit
                | Self::SessionFatal
                | Self::OpenFailed
                | Self::Fault
                | Self::Crashed
        )
    }

    /// End of a normal lifetime; replaced for free.
    pub fn is_lifetime(self) -> bool {
        matches!(self, Self::MaxPolls | Self::LifetimeExceeded)
    }
}

/// Observable state of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub generation: u32,
    pub health: WorkerHealth,
    pub recovery_level: RecoveryLevel,
    pub consecutive_failures: u32,
    pub empty_streak: u32,
    pub level3_escalations: u32,
    pub poll_count: u64,
    pub acquisitions: u32,
    pub spawned_at: DateTime<Utc>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_detection: Option<DetectionKind>,
}

impl WorkerStatus {
    fn new(worker_id: WorkerId, generation: u32) -> Self {
        Self {
            worker_id,
            generation,
            health: WorkerHealth::Healthy,
            recovery_level: RecoveryLevel::HEALTHY,
            consecutive_failures: 0,
            empty_streak: 0,
            level3_escalations: 0,
            poll_count: 0,
            acquisitions: 0,
            spawned_at: Utc::now(),
            last_poll_at: None,
            last_detection: None,
        }
    }
}

/// Status snapshots of live workers. Each worker writes only its own entry.
#[derive(Debug, Default)]
pub struct WorkerBoard {
    entries: DashMap<WorkerId, WorkerStatus>,
}

impl WorkerBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, status: &WorkerStatus) {
        self.entries.insert(status.worker_id, status.clone());
    }

    pub fn remove(&self, worker_id: WorkerId) {
        self.entries.remove(&worker_id);
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<WorkerStatus> {
        self.entries.get(&worker_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, ordered by worker id.
    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        let mut all: Vec<WorkerStatus> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.worker_id);
        all
    }

    /// Number of live workers if every one of them sits at level 3.
    pub fn all_at_max_level(&self) -> Option<usize> {
        let live: Vec<RecoveryLevel> = self
            .entries
            .iter()
            .filter(|e| e.health != WorkerHealth::Dead)
            .map(|e| e.recovery_level)
            .collect();
        if !live.is_empty() && live.iter().all(|l| *l == RecoveryLevel::MAX) {
            Some(live.len())
        } else {
            None
        }
    }
}

/// Shared services every worker uses.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<EngineConfig>,
    pub classifier: Arc<Classifier>,
    pub coordinator: Arc<Coordinator>,
    pub bus: Arc<EventBus>,
    pub board: Arc<WorkerBoard>,
}

/// Final report of a worker task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerExit {
    pub worker_id: WorkerId,
    pub generation: u32,
    pub reason: RetireReason,
    pub polls: u64,
    pub acquisitions: u32,
}

impl WorkerExit {
    pub fn without_session(worker_id: WorkerId, generation: u32, reason: RetireReason) -> Self {
        Self {
            worker_id,
            generation,
            reason,
            polls: 0,
            acquisitions: 0,
        }
    }
}

/// Stop signals a worker listens to.
pub struct StopSignals {
    pub shutdown: watch::Receiver<bool>,
    pub retire: watch::Receiver<bool>,
}

impl StopSignals {
    fn requested(&self) -> Option<RetireReason> {
        if *self.shutdown.borrow() {
            Some(RetireReason::Shutdown)
        } else if *self.retire.borrow() {
            Some(RetireReason::Retired)
        } else {
            None
        }
    }

    async fn wait(&mut self) -> RetireReason {
        loop {
            if let Some(reason) = self.requested() {
                return reason;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return RetireReason::Shutdown;
                    }
                }
                changed = self.retire.changed() => {
                    if changed.is_err() {
                        return RetireReason::Retired;
                    }
                }
            }
        }
    }
}

/// Open a session and run a worker until it stops.
pub async fn launch(
    worker_id: WorkerId,
    generation: u32,
    factory: Arc<dyn DriverFactory>,
    ctx: WorkerContext,
    stop: StopSignals,
) -> WorkerExit {
    let driver = match factory.open(worker_id).await {
        Ok(driver) => driver,
        Err(e) => {
            tracing::warn!(worker = %worker_id, "session open failed: {e:#}");
            ctx.bus.emit(EngineEvent::WorkerRetired {
                worker_id,
                reason: RetireReason::OpenFailed,
                polls: 0,
            });
            return WorkerExit::without_session(worker_id, generation, RetireReason::OpenFailed);
        }
    };
    Worker::new(worker_id, generation, driver, ctx, stop).run().await
}

/// Result of one poll cycle that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Continue { burst: bool },
    Stop(RetireReason),
}

/// `Some` when an error out of a poll cycle ends the worker.
fn retire_reason_for(err: &EngineError, stop_on_quota: bool) -> Option<RetireReason> {
    match err {
        EngineError::QuotaExhausted(_) => stop_on_quota.then_some(RetireReason::QuotaReached),
        EngineError::SessionFatal(_) => Some(RetireReason::SessionFatal),
        e if e.is_fatal_to_worker() => Some(RetireReason::Fault),
        _ => None,
    }
}

fn describe_fault(signal: &RawSignal) -> String {
    match (signal.fault, signal.status) {
        (Some(fault), _) => format!("{fault:?} fault after {}ms", signal.elapsed_ms),
        (None, Some(status)) => format!("status {status}"),
        (None, None) => "no response".to_string(),
    }
}

pub struct Worker {
    status: WorkerStatus,
    driver: Box<dyn SessionDriver>,
    ctx: WorkerContext,
    recovery: RecoveryController,
    scheduler: Scheduler,
    stop: StopSignals,
    started: Instant,
}

impl Worker {
    pub fn new(
        worker_id: WorkerId,
        generation: u32,
        driver: Box<dyn SessionDriver>,
        ctx: WorkerContext,
        stop: StopSignals,
    ) -> Self {
        let seed = match ctx.config.jitter_seed {
            Some(seed) => seed ^ worker_id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15),
            None => rand::random(),
        };
        let scheduler = Scheduler::new(ScheduleWindows::from_config(&ctx.config), seed);
        let recovery = RecoveryController::new(&ctx.config.recovery);
        Self {
            status: WorkerStatus::new(worker_id, generation),
            driver,
            ctx,
            recovery,
            scheduler,
            stop,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.status.worker_id
    }

    pub async fn run(mut self) -> WorkerExit {
        let id = self.id();
        self.ctx.board.publish(&self.status);
        self.ctx.bus.emit(EngineEvent::WorkerSpawned {
            worker_id: id,
            generation: self.status.generation,
        });
        tracing::info!(worker = %id, generation = self.status.generation, "worker started");

        let reason = self.run_loop().await;
        self.finish(reason).await
    }

    async fn run_loop(&mut self) -> RetireReason {
        let id = self.id();
        let stop_on_quota = self.ctx.config.stop_on_quota;
        let mut burst = false;
        loop {
            if let Some(reason) = self.stop.requested() {
                return reason;
            }
            if stop_on_quota && self.ctx.coordinator.is_quota_exhausted() {
                return RetireReason::QuotaReached;
            }
            if let Some(reason) = self.lifetime_reached() {
                return reason;
            }

            let delay = self.scheduler.next(self.recovery.level(), burst);
            tokio::select! {
                biased;
                reason = self.stop.wait() => return reason,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.tick().await {
                Ok(Tick::Continue { burst: next }) => burst = next,
                Ok(Tick::Stop(reason)) => return reason,
                Err(e) => {
                    if let Some(reason) = retire_reason_for(&e, stop_on_quota) {
                        tracing::warn!(worker = %id, ?reason, "worker retiring: {e}");
                        return reason;
                    }
                    if e.is_retryable() {
                        tracing::debug!(worker = %id, "{e}");
                    } else {
                        tracing::warn!(worker = %id, "{e}");
                    }
                    // Losing a race means the listing is live.
                    burst = matches!(e, EngineError::ClaimConflict(_));
                }
            }
        }
    }

    fn lifetime_reached(&self) -> Option<RetireReason> {
        if let Some(max) = self.ctx.config.worker_max_polls {
            if self.status.poll_count >= max {
                return Some(RetireReason::MaxPolls);
            }
        }
        if let Some(max) = self.ctx.config.worker_max_lifetime() {
            if self.started.elapsed() >= max {
                return Some(RetireReason::LifetimeExceeded);
            }
        }
        None
    }

    /// One poll cycle.
    ///
    /// Transient faults and blocks come back as retryable errors once the
    /// recovery step has been applied.
    async fn tick(&mut self) -> Result<Tick, EngineError> {
        let id = self.id();
        let signal = match self.poll_once().await {
            Ok(signal) => signal,
            Err(reason) => return Ok(Tick::Stop(reason)),
        };

        let detection = self
            .ctx
            .classifier
            .classify(&signal, self.status.empty_streak);
        self.status.empty_streak = detection.next_empty_streak(self.status.empty_streak);
        self.status.poll_count += 1;
        self.status.last_poll_at = Some(Utc::now());
        self.status.last_detection = Some(detection.kind());
        match &detection {
            Detection::TransientError
            | Detection::SoftBlock
            | Detection::HardBlock
            | Detection::Challenge => self.status.consecutive_failures += 1,
            _ => self.status.consecutive_failures = 0,
        }
        tracing::debug!(
            worker = %id,
            detection = ?detection.kind(),
            status = ?signal.status,
            elapsed_ms = signal.elapsed_ms,
            "poll classified"
        );

        let decision = self.recovery.observe(&detection);
        self.status.recovery_level = decision.level;
        self.status.level3_escalations = self.recovery.level3_escalations();
        self.update_health(&decision, &detection, decision.give_up);

        if decision.give_up {
            tracing::warn!(
                worker = %id,
                escalations = self.status.level3_escalations,
                "escalation limit reached"
            );
            return Ok(Tick::Stop(RetireReason::EscalationLimit));
        }
        self.apply_recovery(&decision).await?;

        match detection {
            Detection::Available(items) => {
                let pursued = self.pursue(&items).await;
                self.ctx.board.publish(&self.status);
                pursued.map(|()| Tick::Continue { burst: true })
            }
            Detection::TransientError => Err(EngineError::TransientIo(describe_fault(&signal))),
            other => match other.block() {
                Some(kind) => Err(EngineError::BlockDetected { kind }),
                None => Ok(Tick::Continue { burst: false }),
            },
        }
    }

    /// Poll once, bounded by `poll_timeout`. Once a stop is requested the
    /// poll gets `shutdown_grace` to finish before it is dropped.
    async fn poll_once(&mut self) -> Result<RawSignal, RetireReason> {
        let id = self.id();
        let grace = self.ctx.config.shutdown_grace();
        let poll = timeout(self.ctx.config.poll_timeout(), self.driver.poll());
        tokio::pin!(poll);

        let polled = tokio::select! {
            polled = &mut poll => polled,
            reason = self.stop.wait() => match timeout(grace, &mut poll).await {
                Ok(polled) => polled,
                Err(_) => {
                    tracing::warn!(worker = %id, "poll abandoned at shutdown");
                    return Err(reason);
                }
            },
        };
        Ok(match polled {
            Ok(Ok(signal)) => signal,
            Ok(Err(e)) => {
                tracing::warn!(worker = %id, "poll failed: {e:#}");
                RawSignal::fault(TransportFault::Connect)
            }
            Err(_) => {
                tracing::warn!(worker = %id, "poll timed out");
                RawSignal::fault(TransportFault::Timeout)
            }
        })
    }

    fn update_health(&mut self, decision: &RecoveryDecision, detection: &Detection, dead: bool) {
        let from = self.status.health;
        let to = if dead {
            WorkerHealth::Dead
        } else {
            WorkerHealth::for_level(decision.level)
        };
        self.status.health = to;
        self.ctx.board.publish(&self.status);

        if from != to || decision.changed() {
            if let Some(kind) = detection.block() {
                tracing::info!(worker = %self.id(), level = %decision.level, block = %kind, "recovery escalated");
            }
            self.ctx.bus.emit(EngineEvent::WorkerStateChanged {
                worker_id: self.id(),
                from,
                to,
                level: decision.level,
                detection: Some(detection.kind()),
                block: detection.block(),
            });
        }
    }

    /// Ask the driver to carry out the recovery step. A refusal is fatal.
    async fn apply_recovery(&mut self, decision: &RecoveryDecision) -> Result<(), EngineError> {
        let step = match decision.action {
            RecoveryAction::None => return Ok(()),
            RecoveryAction::ClearSession | RecoveryAction::FullWipe => {
                self.driver.reset(decision.level).await
            }
            RecoveryAction::WipeAndRotate => match self.driver.reset(decision.level).await {
                Ok(true) => self.driver.rotate_identity().await,
                other => other,
            },
        };
        match step {
            Ok(true) => Ok(()),
            Ok(false) => Err(EngineError::SessionFatal(format!(
                "driver refused {:?} at level {}",
                decision.action, decision.level
            ))),
            Err(e) => Err(EngineError::SessionFatal(format!(
                "{:?} failed: {e:#}",
                decision.action
            ))),
        }
    }

    /// Claim and act on the best candidates of a positive poll.
    ///
    /// Fails with `ClaimConflict` when every candidate went to another
    /// worker, and with `QuotaExhausted` once no claim can be admitted.
    async fn pursue(&mut self, items: &[RawItem]) -> Result<(), EngineError> {
        let id = self.id();
        let coordinator = Arc::clone(&self.ctx.coordinator);
        let report = coordinator.ingest(id, items);
        if report.tombstoned > 0 {
            tracing::debug!(worker = %id, count = report.tombstoned, "skipped acquired items");
        }

        let mut granted = 0usize;
        let mut lost = None;
        for candidate in coordinator.ranked(&report.seen) {
            if self.stop.requested().is_some() {
                return Ok(());
            }
            let token = match coordinator.try_claim(&candidate.id, id)? {
                ClaimOutcome::Granted(token) => token,
                ClaimOutcome::AlreadyClaimed => {
                    lost = Some(candidate.id);
                    continue;
                }
                ClaimOutcome::Unknown => continue,
                ClaimOutcome::QuotaExhausted => {
                    return Err(EngineError::QuotaExhausted(self.ctx.config.max_acquisitions));
                }
            };
            granted += 1;

            let action = Action::Acquire {
                opportunity_id: candidate.id.to_string(),
                label: candidate.label.clone(),
                price: candidate.price,
                attributes: candidate.attributes.clone(),
            };
            tracing::info!(
                worker = %id,
                opportunity = %candidate.id,
                score = candidate.score,
                "attempting purchase"
            );
            let resolution = match timeout(self.ctx.config.act_timeout(), self.driver.act(&action)).await {
                Ok(Ok(result)) if result.success => Resolution::Success,
                Ok(Ok(result)) => Resolution::failure(
                    result.detail.unwrap_or_else(|| "rejected".to_string()),
                ),
                Ok(Err(e)) => Resolution::failure(format!("{e:#}")),
                Err(_) => Resolution::failure("act timed out"),
            };

            match coordinator.report_outcome(token, resolution) {
                Ok(record) if record.reason.is_none() => {
                    self.status.acquisitions += 1;
                    tracing::info!(worker = %id, opportunity = %record.opportunity_id, "purchase succeeded");
                }
                Ok(record) => {
                    tracing::info!(
                        worker = %id,
                        opportunity = %record.opportunity_id,
                        reason = record.reason.as_deref().unwrap_or_default(),
                        "purchase failed"
                    );
                }
                Err(e) => tracing::warn!(worker = %id, "outcome not recorded: {e}"),
            }
        }

        match lost {
            Some(opportunity) if granted == 0 => {
                Err(EngineError::ClaimConflict(opportunity.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn finish(self, reason: RetireReason) -> WorkerExit {
        let Self {
            mut status,
            driver,
            ctx,
            ..
        } = self;
        let id = status.worker_id;

        if reason.is_death() && status.health != WorkerHealth::Dead {
            let from = status.health;
            status.health = WorkerHealth::Dead;
            ctx.bus.emit(EngineEvent::WorkerStateChanged {
                worker_id: id,
                from,
                to: WorkerHealth::Dead,
                level: status.recovery_level,
                detection: status.last_detection,
                block: None,
            });
        }
        if let Err(e) = driver.close().await {
            tracing::warn!(worker = %id, "session close failed: {e:#}");
        }
        ctx.board.remove(id);
        ctx.bus.emit(EngineEvent::WorkerRetired {
            worker_id: id,
            reason,
            polls: status.poll_count,
        });
        tracing::info!(worker = %id, ?reason, polls = status.poll_count, "worker stopped");

        WorkerExit {
            worker_id: id,
            generation: status.generation,
            reason,
            polls: status.poll_count,
            acquisitions: status.acquisitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::{Script, ScriptedDriver};
    use crate::opportunity::Scorer;
    use std::time::Duration;

    fn test_config() -> EngineConfig {
        EngineConfig {
            min_wait_ms: 1,
            max_wait_ms: 2,
            burst_wait_ms: 1,
            backoff_unit_ms: 1,
            jitter_seed: Some(7),
            ..EngineConfig::default()
        }
    }

    fn context(config: EngineConfig) -> WorkerContext {
        let bus = Arc::new(EventBus::new(256));
        let coordinator = Arc::new(Coordinator::new(
            Scorer::new(config.scoring.clone()),
            config.max_acquisitions,
            config.claim_timeout(),
            Arc::clone(&bus),
        ));
        WorkerContext {
            classifier: Arc::new(Classifier::new(&config.detection, &config.recovery).unwrap()),
            config: Arc::new(config),
            coordinator,
            bus,
            board: Arc::new(WorkerBoard::new()),
        }
    }

    fn signals() -> (watch::Sender<bool>, watch::Sender<bool>, StopSignals) {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (retire_tx, retire) = watch::channel(false);
        (shutdown_tx, retire_tx, StopSignals { shutdown, retire })
    }

    #[test]
    fn test_retire_reason_classes() {
        assert!(RetireReason::EscalationLimit.is_death());
        assert!(RetireReason::SessionFatal.is_death());
        assert!(!RetireReason::Shutdown.is_death());
        assert!(RetireReason::Fault.is_death());
        assert!(RetireReason::MaxPolls.is_lifetime());
        assert!(!RetireReason::Retired.is_lifetime());
    }

    #[test]
    fn test_cycle_errors_map_to_retirement() {
        let quota = EngineError::QuotaExhausted(1);
        assert_eq!(retire_reason_for(&quota, true), Some(RetireReason::QuotaReached));
        assert_eq!(retire_reason_for(&quota, false), None);
        assert_eq!(
            retire_reason_for(&EngineError::SessionFatal("gone".into()), true),
            Some(RetireReason::SessionFatal)
        );
        assert_eq!(
            retire_reason_for(&EngineError::CoordinatorCorruption("dup".into()), true),
            Some(RetireReason::Fault)
        );
        assert_eq!(retire_reason_for(&EngineError::TransientIo("reset".into()), true), None);
        assert_eq!(retire_reason_for(&EngineError::ClaimConflict("ab".into()), true), None);
    }

    #[test]
    fn test_fault_description() {
        assert_eq!(describe_fault(&RawSignal::page(503, "")), "status 503");
        assert!(describe_fault(&RawSignal::fault(TransportFault::Timeout)).starts_with("Timeout fault"));
    }

    #[test]
    fn test_board_detects_pool_wide_level_three() {
        let board = WorkerBoard::new();
        let mut a = WorkerStatus::new(WorkerId(0), 0);
        let mut b = WorkerStatus::new(WorkerId(1), 0);
        a.recovery_level = RecoveryLevel::MAX;
        b.recovery_level = RecoveryLevel::new(2);
        board.publish(&a);
        board.publish(&b);
        assert_eq!(board.all_at_max_level(), None);

        b.recovery_level = RecoveryLevel::MAX;
        board.publish(&b);
        assert_eq!(board.all_at_max_level(), Some(2));
        let ids: Vec<WorkerId> = board.snapshot().iter().map(|s| s.worker_id).collect();
        assert_eq!(ids, vec![WorkerId(0), WorkerId(1)]);
        assert!(WorkerBoard::new().all_at_max_level().is_none());
    }

    #[tokio::test]
    async fn test_worker_buys_and_stops_on_quota() {
        let ctx = context(test_config());
        let driver = ScriptedDriver::new(Script::new(vec![RawSignal::with_items(vec![
            RawItem::new("cheap").with_price(10.0),
            RawItem::new("pricey").with_price(90.0),
        ])]));
        let probe = driver.probe();
        let (_s, _r, stop) = signals();

        let exit = Worker::new(WorkerId(0), 0, Box::new(driver), ctx.clone(), stop)
            .run()
            .await;

        assert_eq!(exit.reason, RetireReason::QuotaReached);
        assert_eq!(exit.acquisitions, 1);
        assert_eq!(probe.acts(), 1);
        assert!(probe.is_closed());
        assert!(ctx.board.is_empty());
        assert_eq!(ctx.coordinator.snapshot().acquisitions, 1);
    }

    #[tokio::test]
    async fn test_worker_dies_at_escalation_limit() {
        let ctx = context(test_config());
        let driver = ScriptedDriver::new(Script::new(vec![]).then(RawSignal::page(403, "denied")));
        let probe = driver.probe();
        let (_s, _r, stop) = signals();

        let exit = Worker::new(WorkerId(3), 0, Box::new(driver), ctx, stop).run().await;

        assert_eq!(exit.reason, RetireReason::EscalationLimit);
        assert_eq!(exit.polls, 12);
        assert_eq!(probe.rotations(), 9);
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn test_refused_reset_is_fatal() {
        let ctx = context(test_config());
        let driver = ScriptedDriver::new(
            Script::new(vec![RawSignal::page(403, "denied")]).refusing_reset(),
        );
        let (_s, _r, stop) = signals();

        let exit = Worker::new(WorkerId(1), 0, Box::new(driver), ctx, stop).run().await;
        assert_eq!(exit.reason, RetireReason::SessionFatal);
        assert_eq!(exit.polls, 1);
    }

    #[tokio::test]
    async fn test_worker_retires_after_max_polls() {
        let ctx = context(EngineConfig {
            worker_max_polls: Some(3),
            ..test_config()
        });
        let driver = ScriptedDriver::new(Script::new(vec![]));
        let (_s, _r, stop) = signals();

        let exit = Worker::new(WorkerId(1), 0, Box::new(driver), ctx, stop).run().await;
        assert_eq!(exit.reason, RetireReason::MaxPolls);
        assert_eq!(exit.polls, 3);
    }

    #[tokio::test]
    async fn test_claimed_item_is_left_alone() {
        let ctx = context(EngineConfig {
            worker_max_polls: Some(2),
            ..test_config()
        });
        let item = RawItem::new("contested");
        let id = ctx.coordinator.ingest(WorkerId(9), &[item.clone()]).seen.remove(0);
        assert!(ctx.coordinator.try_claim(&id, WorkerId(9)).unwrap().token().is_some());

        let driver = ScriptedDriver::new(Script::repeating(vec![RawSignal::with_items(vec![item])]));
        let probe = driver.probe();
        let (_s, _r, stop) = signals();

        let exit = Worker::new(WorkerId(0), 0, Box::new(driver), ctx, stop).run().await;
        assert_eq!(exit.reason, RetireReason::MaxPolls);
        assert_eq!(exit.polls, 2);
        assert_eq!(probe.acts(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_slow_poll_after_grace() {
        let ctx = context(EngineConfig {
            shutdown_grace_ms: 50,
            ..test_config()
        });
        let mut script = Script::new(vec![]);
        script.poll_delay_ms = 60_000;
        let driver = ScriptedDriver::new(script);
        let probe = driver.probe();
        let (shutdown_tx, _r, stop) = signals();

        let task = tokio::spawn(Worker::new(WorkerId(0), 0, Box::new(driver), ctx, stop).run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        let exit = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(exit.reason, RetireReason::Shutdown);
        assert_eq!(exit.polls, 0);
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let ctx = context(EngineConfig {
            min_wait_ms: 60_000,
            max_wait_ms: 60_000,
            ..test_config()
        });
        let driver = ScriptedDriver::new(Script::new(vec![]));
        let probe = driver.probe();
        let (shutdown_tx, _r, stop) = signals();

        let task = tokio::spawn(Worker::new(WorkerId(0), 0, Box::new(driver), ctx, stop).run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        let exit = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(exit.reason, RetireReason::Shutdown);
        assert_eq!(probe.polls(), 0);
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn test_state_change_events_follow_escalation() {
        let ctx = context(EngineConfig {
            worker_max_polls: Some(4),
            ..test_config()
        });
        let mut rx = ctx.bus.subscribe();
        let driver = ScriptedDriver::new(Script::new(vec![
            RawSignal::page(403, "denied"),
            RawSignal::genuinely_empty(),
            RawSignal::genuinely_empty(),
            RawSignal::genuinely_empty(),
        ]));
        let (_s, _r, stop) = signals();
        Worker::new(WorkerId(2), 0, Box::new(driver), ctx, stop).run().await;

        let changes: Vec<(WorkerHealth, WorkerHealth)> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                EngineEvent::WorkerStateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                (WorkerHealth::Healthy, WorkerHealth::Degraded),
                (WorkerHealth::Degraded, WorkerHealth::Healthy),
            ]
        );
    }
}
