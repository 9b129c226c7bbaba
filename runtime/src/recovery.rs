// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-worker recovery state machine.
//!
//! Levels run from 0 (healthy) to 3 (degraded). Blocks raise the level by
//! one, capped at 3; a positive detection or a streak of genuine empties
//! drops it back to 0. The level never decreases any other way.
//!
//! An ambiguous empty says nothing about whether the session is being
//! throttled, so it neither extends nor breaks the healthy streak.

use crate::classifier::Detection;
use crate::config::RecoveryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Degradation tier of a worker, always in `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryLevel(u8);

impl RecoveryLevel {
    pub const HEALTHY: Self = Self(0);
    pub const MAX: Self = Self(3);

    /// Clamps into the valid range.
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::MAX.0))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn escalate(self) -> Self {
        Self::new(self.0.saturating_add(1))
    }

    pub fn is_healthy(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecoveryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the worker must ask its driver to do before the next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    None,
    /// Level 1: clear local session state.
    ClearSession,
    /// Level 2: full state wipe including caches.
    FullWipe,
    /// Level 3: full wipe plus a new session identity.
    WipeAndRotate,
}

impl RecoveryAction {
    pub fn for_level(level: RecoveryLevel) -> Self {
        match level.get() {
            0 => Self::None,
            1 => Self::ClearSession,
            2 => Self::FullWipe,
            _ => Self::WipeAndRotate,
        }
    }
}

/// Decision for one observed detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub previous: RecoveryLevel,
    pub level: RecoveryLevel,
    pub action: RecoveryAction,
    /// Escalation budget exhausted: the worker must die.
    pub give_up: bool,
}

impl RecoveryDecision {
    pub fn changed(&self) -> bool {
        self.previous != self.level
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryController {
    level: RecoveryLevel,
    healthy_streak: u32,
    level3_escalations: u32,
    healthy_streak_target: u32,
    max_level3_escalations: u32,
}

impl RecoveryController {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            level: RecoveryLevel::HEALTHY,
            healthy_streak: 0,
            level3_escalations: 0,
            healthy_streak_target: config.healthy_streak.max(1),
            max_level3_escalations: config.max_level3_escalations.max(1),
        }
    }

    pub fn level(&self) -> RecoveryLevel {
        self.level
    }

    pub fn level3_escalations(&self) -> u32 {
        self.level3_escalations
    }

    /// Feed one detection through the state machine.
    pub fn observe(&mut self, detection: &Detection) -> RecoveryDecision {
        let previous = self.level;
        let mut action = RecoveryAction::None;

        match detection {
            Detection::SoftBlock | Detection::HardBlock | Detection::Challenge => {
                self.healthy_streak = 0;
                self.level = self.level.escalate();
                if self.level == RecoveryLevel::MAX {
                    self.level3_escalations = self.level3_escalations.saturating_add(1);
                }
                action = RecoveryAction::for_level(self.level);
            }
            Detection::Available(_) => self.reset(),
            Detection::Empty { ambiguous: false } => {
                self.healthy_streak = self.healthy_streak.saturating_add(1);
                if self.healthy_streak >= self.healthy_streak_target {
                    self.reset();
                }
            }
            Detection::Empty { ambiguous: true } | Detection::TransientError => {}
        }

        RecoveryDecision {
            previous,
            level: self.level,
            action,
            give_up: self.level3_escalations >= self.max_level3_escalations,
        }
    }

    /// Explicit reset to level 0.
    pub fn reset(&mut self) {
        self.level = RecoveryLevel::HEALTHY;
        self.healthy_streak = 0;
        self.level3_escalations = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RecoveryController {
        RecoveryController::new(&RecoveryConfig::default())
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(RecoveryLevel::new(9), RecoveryLevel::MAX);
        assert_eq!(RecoveryLevel::MAX.escalate(), RecoveryLevel::MAX);
    }

    #[test]
    fn test_blocks_escalate_one_level_at_a_time() {
        let mut rc = controller();
        let d1 = rc.observe(&Detection::HardBlock);
        assert_eq!(d1.level.get(), 1);
        assert_eq!(d1.action, RecoveryAction::ClearSession);
        assert!(d1.changed());

        let d2 = rc.observe(&Detection::Challenge);
        assert_eq!(d2.level.get(), 2);
        assert_eq!(d2.action, RecoveryAction::FullWipe);

        let d3 = rc.observe(&Detection::SoftBlock);
        assert_eq!(d3.level.get(), 3);
        assert_eq!(d3.action, RecoveryAction::WipeAndRotate);

        let d4 = rc.observe(&Detection::HardBlock);
        assert_eq!(d4.level.get(), 3);
        assert!(!d4.changed());
        assert_eq!(rc.level3_escalations(), 2);
    }

    #[test]
    fn test_soft_block_moves_zero_to_one() {
        let mut rc = controller();
        let d = rc.observe(&Detection::SoftBlock);
        assert_eq!(d.previous.get(), 0);
        assert_eq!(d.level.get(), 1);
    }

    #[test]
    fn test_available_resets() {
        let mut rc = controller();
        rc.observe(&Detection::HardBlock);
        rc.observe(&Detection::HardBlock);
        let d = rc.observe(&Detection::Available(vec![]));
        assert!(d.level.is_healthy());
        assert_eq!(d.action, RecoveryAction::None);
    }

    #[test]
    fn test_healthy_streak_resets() {
        let mut rc = controller();
        rc.observe(&Detection::HardBlock);
        rc.observe(&Detection::Empty { ambiguous: false });
        rc.observe(&Detection::Empty { ambiguous: false });
        assert_eq!(rc.level().get(), 1);
        rc.observe(&Detection::Empty { ambiguous: false });
        assert_eq!(rc.level().get(), 0);
    }

    #[test]
    fn test_ambiguous_empties_do_not_count_as_healthy() {
        let mut rc = controller();
        rc.observe(&Detection::SoftBlock);
        for _ in 0..10 {
            rc.observe(&Detection::Empty { ambiguous: true });
        }
        assert_eq!(rc.level().get(), 1);
        // Nor do they break a streak in progress.
        rc.observe(&Detection::Empty { ambiguous: false });
        rc.observe(&Detection::Empty { ambiguous: true });
        rc.observe(&Detection::Empty { ambiguous: false });
        rc.observe(&Detection::Empty { ambiguous: false });
        assert_eq!(rc.level().get(), 0);
    }

    #[test]
    fn test_sustained_silent_throttling_escalates_to_rotation() {
        use crate::classifier::Classifier;
        use crate::config::DetectionConfig;
        use crate::driver::RawSignal;

        let classifier =
            Classifier::new(&DetectionConfig::default(), &RecoveryConfig::default()).unwrap();
        let mut rc = controller();
        let mut streak = 0;
        let mut max_level = RecoveryLevel::HEALTHY;
        let mut gave_up_at = None;
        for poll in 1..=200 {
            let detection = classifier.classify(&RawSignal::ambiguous_empty(), streak);
            streak = detection.next_empty_streak(streak);
            let d = rc.observe(&detection);
            max_level = max_level.max(d.level);
            if d.give_up {
                gave_up_at = Some(poll);
                break;
            }
        }
        assert_eq!(max_level, RecoveryLevel::MAX);
        // A soft block every fifth poll: two to reach level 2, ten at level 3.
        assert_eq!(gave_up_at, Some(60));
    }

    #[test]
    fn test_transient_is_neutral() {
        let mut rc = controller();
        rc.observe(&Detection::HardBlock);
        rc.observe(&Detection::Empty { ambiguous: false });
        rc.observe(&Detection::TransientError);
        rc.observe(&Detection::Empty { ambiguous: false });
        assert_eq!(rc.level().get(), 1);
        let d = rc.observe(&Detection::TransientError);
        assert!(!d.changed());
    }

    #[test]
    fn test_level_never_exceeds_max_and_gives_up() {
        let mut rc = controller();
        let mut gave_up_at = None;
        for i in 1..=20 {
            let d = rc.observe(&Detection::HardBlock);
            assert!(d.level <= RecoveryLevel::MAX);
            if d.give_up && gave_up_at.is_none() {
                gave_up_at = Some(i);
            }
        }
        // Two blocks to reach level 2, then ten escalations at level 3.
        assert_eq!(gave_up_at, Some(12));
    }

    #[test]
    fn test_recovery_clears_escalation_count() {
        let mut rc = controller();
        for _ in 0..8 {
            rc.observe(&Detection::HardBlock);
        }
        assert!(rc.level3_escalations() > 0);
        rc.observe(&Detection::Available(vec![]));
        assert_eq!(rc.level3_escalations(), 0);
    }
}
