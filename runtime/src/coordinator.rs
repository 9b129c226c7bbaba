// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Purchase coordinator: process-wide claim arbitration and quota.
//!
//! One mutex guards the opportunity table, the live claims and the quota.
//! Every operation is a short map/counter update; no I/O ever happens while
//! the lock is held, and events are emitted after it is released.
//!
//! A claim is admitted only while `current + reserved < max`, so the number
//! of acquisitions can never pass the cap even if every live claim succeeds.

use crate::driver::RawItem;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::ids::{ClaimToken, OpportunityId, WorkerId};
use crate::opportunity::{IngestReport, OpportunityTable, OpportunityView, Scorer};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Answer to a claim request. Only `Granted` allows touching the opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted(ClaimToken),
    AlreadyClaimed,
    QuotaExhausted,
    /// The id is not tracked (never seen, or purged).
    Unknown,
}

impl ClaimOutcome {
    pub fn token(&self) -> Option<ClaimToken> {
        match self {
            Self::Granted(token) => Some(*token),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure,
}

/// How a claim holder resolves its attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Success,
    Failure { reason: String },
}

impl Resolution {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

/// A live claim.
#[derive(Debug, Clone)]
pub struct PurchaseAttempt {
    pub opportunity_id: OpportunityId,
    pub worker_id: WorkerId,
    pub claim_token: ClaimToken,
    pub started_at: Instant,
    pub deadline: Instant,
    pub outcome: AttemptOutcome,
}

/// Terminal record of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub opportunity_id: OpportunityId,
    pub worker_id: WorkerId,
    pub claim_token: ClaimToken,
    pub outcome: AttemptOutcome,
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct GlobalQuota {
    pub max_acquisitions: u32,
    pub current_acquisitions: u32,
    /// Opportunities with an in-flight claim.
    pub reserved: HashSet<OpportunityId>,
}

impl GlobalQuota {
    fn new(max_acquisitions: u32) -> Self {
        Self {
            max_acquisitions,
            current_acquisitions: 0,
            reserved: HashSet::new(),
        }
    }

    fn has_room(&self) -> bool {
        (self.current_acquisitions as usize + self.reserved.len())
            < self.max_acquisitions as usize
    }

    fn is_exhausted(&self) -> bool {
        self.current_acquisitions >= self.max_acquisitions
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub acquisitions: u32,
    pub max_acquisitions: u32,
    pub pending_claims: usize,
    pub tracked_opportunities: usize,
    pub acquired_identities: usize,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub expired_claims: u64,
}

struct CoordinatorState {
    table: OpportunityTable,
    quota: GlobalQuota,
    pending: HashMap<ClaimToken, PurchaseAttempt>,
    pending_by_opportunity: HashMap<OpportunityId, ClaimToken>,
    attempts: u64,
    successes: u64,
    failures: u64,
    expired: u64,
    quota_announced: bool,
}

pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    claim_timeout: Duration,
    bus: Arc<EventBus>,
}

impl Coordinator {
    pub fn new(
        scorer: Scorer,
        max_acquisitions: u32,
        claim_timeout: Duration,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                table: OpportunityTable::new(scorer),
                quota: GlobalQuota::new(max_acquisitions),
                pending: HashMap::new(),
                pending_by_opportunity: HashMap::new(),
                attempts: 0,
                successes: 0,
                failures: 0,
                expired: 0,
                quota_announced: false,
            }),
            claim_timeout,
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        // Critical sections never panic half-way through an update.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.bus.emit(event);
        }
    }

    /// Track the items of one positive poll.
    pub fn ingest(&self, worker: WorkerId, items: &[RawItem]) -> IngestReport {
        self.ingest_at(worker, items, Instant::now())
    }

    pub fn ingest_at(&self, worker: WorkerId, items: &[RawItem], now: Instant) -> IngestReport {
        let report = self.lock().table.ingest(worker, items, now);

        let mut events = Vec::with_capacity(report.discovered.len() + report.rescored.len());
        for view in &report.discovered {
            events.push(EngineEvent::OpportunityDiscovered {
                opportunity_id: view.id.clone(),
                worker_id: worker,
                category: view.category,
                label: view.label.clone(),
                price: view.price,
                score: view.score,
            });
        }
        for (view, old_score) in &report.rescored {
            events.push(EngineEvent::OpportunityRescored {
                opportunity_id: view.id.clone(),
                old_score: *old_score,
                new_score: view.score,
                price: view.price,
            });
        }
        self.emit_all(events);
        report
    }

    /// Unclaimed opportunities among `ids`, in the order they should be tried.
    pub fn ranked(&self, ids: &[OpportunityId]) -> Vec<OpportunityView> {
        self.lock().table.ranked(ids)
    }

    pub fn try_claim(&self, opportunity_id: &OpportunityId, worker: WorkerId) -> Result<ClaimOutcome> {
        self.try_claim_at(opportunity_id, worker, Instant::now())
    }

    /// Compare-and-set on the opportunity's claim state.
    pub fn try_claim_at(
        &self,
        opportunity_id: &OpportunityId,
        worker: WorkerId,
        now: Instant,
    ) -> Result<ClaimOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut state = self.lock();
            expire_claims(&mut state, now, &mut events);
            let st = &mut *state;

            let Some(opportunity) = st.table.get_mut(opportunity_id) else {
                let outcome = if st.table.is_tombstoned(opportunity_id) {
                    ClaimOutcome::AlreadyClaimed
                } else {
                    ClaimOutcome::Unknown
                };
                drop(state);
                self.emit_all(events);
                return Ok(outcome);
            };

            if opportunity.claimed {
                ClaimOutcome::AlreadyClaimed
            } else if !st.quota.has_room() {
                ClaimOutcome::QuotaExhausted
            } else if st.pending_by_opportunity.contains_key(opportunity_id)
                || st.quota.reserved.contains(opportunity_id)
            {
                tracing::error!(
                    opportunity = %opportunity_id,
                    "unclaimed opportunity still holds a live claim"
                );
                drop(state);
                self.emit_all(events);
                return Err(EngineError::CoordinatorCorruption(format!(
                    "duplicate live claim on {opportunity_id}"
                )));
            } else {
                let token = ClaimToken::new();
                opportunity.claimed = true;
                st.quota.reserved.insert(opportunity_id.clone());
                st.pending_by_opportunity
                    .insert(opportunity_id.clone(), token);
                st.pending.insert(
                    token,
                    PurchaseAttempt {
                        opportunity_id: opportunity_id.clone(),
                        worker_id: worker,
                        claim_token: token,
                        started_at: now,
                        deadline: now + self.claim_timeout,
                        outcome: AttemptOutcome::Pending,
                    },
                );
                st.attempts += 1;
                events.push(EngineEvent::PurchaseAttempted {
                    opportunity_id: opportunity_id.clone(),
                    worker_id: worker,
                    claim_token: token,
                });
                ClaimOutcome::Granted(token)
            }
        };
        self.emit_all(events);
        Ok(outcome)
    }

    pub fn report_outcome(&self, token: ClaimToken, resolution: Resolution) -> Result<AttemptRecord> {
        self.report_outcome_at(token, resolution, Instant::now())
    }

    /// Resolve a claim. Success is irreversible; failure frees the
    /// opportunity for any worker.
    pub fn report_outcome_at(
        &self,
        token: ClaimToken,
        resolution: Resolution,
        now: Instant,
    ) -> Result<AttemptRecord> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock();
            expire_claims(&mut state, now, &mut events);
            let st = &mut *state;

            match st.pending.remove(&token) {
                None => Err(EngineError::StaleClaim(token.to_string())),
                Some(mut attempt) => {
                    st.pending_by_opportunity.remove(&attempt.opportunity_id);
                    st.quota.reserved.remove(&attempt.opportunity_id);
                    let elapsed_ms = now.saturating_duration_since(attempt.started_at).as_millis() as u64;

                    match resolution {
                        Resolution::Success => {
                            attempt.outcome = AttemptOutcome::Success;
                            st.quota.current_acquisitions += 1;
                            st.successes += 1;
                            st.table.tombstone(&attempt.opportunity_id);
                            if st.quota.current_acquisitions > st.quota.max_acquisitions {
                                tracing::error!(
                                    current = st.quota.current_acquisitions,
                                    max = st.quota.max_acquisitions,
                                    "acquisition cap exceeded"
                                );
                                return Err(EngineError::CoordinatorCorruption(
                                    "acquisitions exceed quota".into(),
                                ));
                            }
                            events.push(EngineEvent::PurchaseSucceeded {
                                opportunity_id: attempt.opportunity_id.clone(),
                                worker_id: attempt.worker_id,
                                acquisitions: st.quota.current_acquisitions,
                                elapsed_ms,
                            });
                            if st.quota.is_exhausted() && !st.quota_announced {
                                st.quota_announced = true;
                                events.push(EngineEvent::QuotaReached {
                                    acquisitions: st.quota.current_acquisitions,
                                });
                            }
                            Ok(AttemptRecord {
                                opportunity_id: attempt.opportunity_id,
                                worker_id: attempt.worker_id,
                                claim_token: token,
                                outcome: AttemptOutcome::Success,
                                reason: None,
                                elapsed_ms,
                            })
                        }
                        Resolution::Failure { reason } => {
                            attempt.outcome = AttemptOutcome::Failure;
                            st.failures += 1;
                            if let Some(opportunity) = st.table.get_mut(&attempt.opportunity_id) {
                                opportunity.claimed = false;
                            }
                            events.push(EngineEvent::PurchaseFailed {
                                opportunity_id: attempt.opportunity_id.clone(),
                                worker_id: attempt.worker_id,
                                reason: reason.clone(),
                            });
                            Ok(AttemptRecord {
                                opportunity_id: attempt.opportunity_id,
                                worker_id: attempt.worker_id,
                                claim_token: token,
                                outcome: AttemptOutcome::Failure,
                                reason: Some(reason),
                                elapsed_ms,
                            })
                        }
                    }
                }
            }
        };
        self.emit_all(events);
        result
    }

    /// Release overdue claims and purge stale opportunities.
    ///
    /// Returns `(expired_claims, purged_opportunities)`.
    pub fn sweep(&self, now: Instant, opportunity_ttl: Duration) -> (usize, usize) {
        let mut events = Vec::new();
        let (expired, purged) = {
            let mut state = self.lock();
            let expired = expire_claims(&mut state, now, &mut events);
            let purged = state.table.purge_expired(now, opportunity_ttl).len();
            (expired, purged)
        };
        self.emit_all(events);
        (expired, purged)
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.lock().quota.is_exhausted()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Workers currently holding a pending claim.
    pub fn claim_holders(&self) -> HashSet<WorkerId> {
        self.lock().pending.values().map(|a| a.worker_id).collect()
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.lock();
        CoordinatorSnapshot {
            acquisitions: state.quota.current_acquisitions,
            max_acquisitions: state.quota.max_acquisitions,
            pending_claims: state.pending.len(),
            tracked_opportunities: state.table.len(),
            acquired_identities: state.table.tombstone_count(),
            attempts: state.attempts,
            successes: state.successes,
            failures: state.failures,
            expired_claims: state.expired,
        }
    }
}

/// Release every claim whose deadline has passed.
fn expire_claims(
    state: &mut CoordinatorState,
    now: Instant,
    events: &mut Vec<EngineEvent>,
) -> usize {
    let overdue: Vec<ClaimToken> = state
        .pending
        .values()
        .filter(|a| a.deadline <= now)
        .map(|a| a.claim_token)
        .collect();

    for token in &overdue {
        if let Some(attempt) = state.pending.remove(token) {
            state.pending_by_opportunity.remove(&attempt.opportunity_id);
            state.quota.reserved.remove(&attempt.opportunity_id);
            if let Some(opportunity) = state.table.get_mut(&attempt.opportunity_id) {
                opportunity.claimed = false;
            }
            state.expired += 1;
            tracing::warn!(
                opportunity = %attempt.opportunity_id,
                worker = %attempt.worker_id,
                "claim expired without an outcome"
            );
            events.push(EngineEvent::ClaimExpired {
                opportunity_id: attempt.opportunity_id,
                worker_id: attempt.worker_id,
            });
        }
    }
    overdue.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;
    use std::sync::Barrier;

    fn coordinator(max: u32) -> Coordinator {
        Coordinator::new(
            Scorer::new(ScoringConfig::default()),
            max,
            Duration::from_secs(30),
            Arc::new(EventBus::new(64)),
        )
    }

    fn discover(c: &Coordinator, labels: &[&str]) -> Vec<OpportunityId> {
        let items: Vec<RawItem> = labels.iter().map(|l| RawItem::new(*l)).collect();
        c.ingest(WorkerId(0), &items).seen
    }

    #[test]
    fn test_same_tick_claim_has_one_winner() {
        let c = Arc::new(coordinator(5));
        let id = discover(&c, &["x"]).remove(0);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let c = Arc::clone(&c);
                let id = id.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    c.try_claim(&id, WorkerId(w)).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = outcomes.iter().filter(|o| o.token().is_some()).count();
        assert_eq!(winners, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ClaimOutcome::AlreadyClaimed)
                .count(),
            7
        );
        assert_eq!(c.pending_count(), 1);
    }

    #[test]
    fn test_quota_blocks_after_success() {
        let c = coordinator(1);
        let ids = discover(&c, &["x", "y"]);
        let token = c.try_claim(&ids[0], WorkerId(1)).unwrap().token().unwrap();
        c.report_outcome(token, Resolution::Success).unwrap();

        assert_eq!(
            c.try_claim(&ids[1], WorkerId(2)).unwrap(),
            ClaimOutcome::QuotaExhausted
        );
        assert!(c.is_quota_exhausted());
        assert_eq!(c.snapshot().acquisitions, 1);
    }

    #[test]
    fn test_in_flight_claim_reserves_quota() {
        let c = coordinator(1);
        let ids = discover(&c, &["x", "y"]);
        assert!(c.try_claim(&ids[0], WorkerId(1)).unwrap().token().is_some());
        assert_eq!(
            c.try_claim(&ids[1], WorkerId(2)).unwrap(),
            ClaimOutcome::QuotaExhausted
        );
        assert_eq!(c.claim_holders(), HashSet::from([WorkerId(1)]));
    }

    #[test]
    fn test_failure_releases_for_immediate_reclaim() {
        let c = coordinator(1);
        let id = discover(&c, &["x"]).remove(0);
        let token = c.try_claim(&id, WorkerId(1)).unwrap().token().unwrap();
        let record = c
            .report_outcome(token, Resolution::failure("sold out at checkout"))
            .unwrap();
        assert_eq!(record.outcome, AttemptOutcome::Failure);

        let again = c.try_claim(&id, WorkerId(2)).unwrap();
        assert!(again.token().is_some());
        assert_eq!(c.snapshot().failures, 1);
    }

    #[test]
    fn test_success_is_terminal() {
        let c = coordinator(3);
        let id = discover(&c, &["x"]).remove(0);
        let token = c.try_claim(&id, WorkerId(1)).unwrap().token().unwrap();
        c.report_outcome(token, Resolution::Success).unwrap();

        assert_eq!(c.try_claim(&id, WorkerId(2)).unwrap(), ClaimOutcome::AlreadyClaimed);
        // Seeing it again does not bring it back.
        let report = c.ingest(WorkerId(3), &[RawItem::new("x")]);
        assert!(report.discovered.is_empty());
        assert!(matches!(
            c.report_outcome(token, Resolution::Success),
            Err(EngineError::StaleClaim(_))
        ));
        assert_eq!(c.snapshot().acquisitions, 1);
    }

    #[test]
    fn test_unreported_claim_expires() {
        let c = coordinator(1);
        let id = discover(&c, &["x"]).remove(0);
        let t0 = Instant::now();
        let token = c.try_claim_at(&id, WorkerId(1), t0).unwrap().token().unwrap();

        assert_eq!(
            c.try_claim_at(&id, WorkerId(2), t0 + Duration::from_secs(29)).unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        let later = t0 + Duration::from_secs(31);
        let reclaim = c.try_claim_at(&id, WorkerId(2), later).unwrap();
        assert!(reclaim.token().is_some());
        assert_eq!(c.snapshot().expired_claims, 1);

        // The original holder reports too late.
        assert!(matches!(
            c.report_outcome_at(token, Resolution::Success, later),
            Err(EngineError::StaleClaim(_))
        ));
        assert_eq!(c.snapshot().acquisitions, 0);
    }

    #[test]
    fn test_sweep_expires_and_purges() {
        let c = coordinator(2);
        let ids = discover(&c, &["x", "y"]);
        let t0 = Instant::now();
        c.try_claim_at(&ids[0], WorkerId(1), t0).unwrap();
        let (expired, purged) = c.sweep(t0 + Duration::from_secs(31), Duration::from_secs(3600));
        assert_eq!((expired, purged), (1, 0));
        assert_eq!(c.pending_count(), 0);

        let (_, purged) = c.sweep(t0 + Duration::from_secs(7200), Duration::from_secs(3600));
        assert_eq!(purged, 2);
        assert_eq!(
            c.try_claim(&ids[1], WorkerId(1)).unwrap(),
            ClaimOutcome::Unknown
        );
    }

    #[test]
    fn test_events_follow_claim_lifecycle() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let c = Coordinator::new(
            Scorer::new(ScoringConfig::default()),
            1,
            Duration::from_secs(30),
            Arc::clone(&bus),
        );
        let id = discover(&c, &["x"]).remove(0);
        let token = c.try_claim(&id, WorkerId(1)).unwrap().token().unwrap();
        c.report_outcome(token, Resolution::Success).unwrap();

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "opportunity_discovered",
                "purchase_attempted",
                "purchase_succeeded",
                "quota_reached"
            ]
        );
    }

    #[test]
    fn test_duplicate_live_claim_is_corruption() {
        let c = coordinator(2);
        let id = discover(&c, &["x"]).remove(0);
        c.lock().quota.reserved.insert(id.clone());
        assert!(matches!(
            c.try_claim(&id, WorkerId(1)),
            Err(EngineError::CoordinatorCorruption(_))
        ));
    }

    #[test]
    fn test_quota_never_exceeded_under_contention() {
        let c = Arc::new(coordinator(3));
        let labels: Vec<String> = (0..20).map(|i| format!("item-{i}")).collect();
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let ids = Arc::new(discover(&c, &refs));

        let handles: Vec<_> = (0..6)
            .map(|w| {
                let c = Arc::clone(&c);
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    for (i, id) in ids.iter().enumerate() {
                        if let ClaimOutcome::Granted(token) = c.try_claim(id, WorkerId(w)).unwrap() {
                            let snap = c.snapshot();
                            assert!(snap.acquisitions <= snap.max_acquisitions);
                            let resolution = if (i + w as usize) % 2 == 0 {
                                Resolution::Success
                            } else {
                                Resolution::failure("rejected")
                            };
                            c.report_outcome(token, resolution).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = c.snapshot();
        assert!(snap.acquisitions <= 3);
        assert_eq!(snap.pending_claims, 0);
    }
}
