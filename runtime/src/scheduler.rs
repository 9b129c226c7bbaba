// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Poll scheduling.
//!
//! [`next_delay`] is a pure function of the recovery level, the burst flag
//! and a jitter seed, so schedules can be tested without real time passing.
//! [`Scheduler`] wraps it with a per-worker seeded RNG.

use crate::config::EngineConfig;
use crate::recovery::RecoveryLevel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Floor for burst-mode intervals.
pub const MIN_BURST_WAIT: Duration = Duration::from_millis(50);

/// Backoff windows per level, in backoff units: `(low, high)`.
const LEVEL_UNITS: [(u32, u32); 3] = [(1, 2), (3, 5), (5, 10)];

/// Interval bounds the scheduler draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindows {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub backoff_unit: Duration,
    pub burst_wait: Duration,
}

impl ScheduleWindows {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_wait: config.min_wait(),
            max_wait: config.max_wait(),
            backoff_unit: config.backoff_unit(),
            burst_wait: config.burst_wait(),
        }
    }

    /// `[low, high]` window for a recovery level.
    pub fn window(&self, level: RecoveryLevel) -> (Duration, Duration) {
        match level.get() {
            0 => (self.min_wait, self.max_wait.max(self.min_wait)),
            n => {
                let (lo, hi) = LEVEL_UNITS[(n as usize - 1).min(LEVEL_UNITS.len() - 1)];
                (self.backoff_unit * lo, self.backoff_unit * hi)
            }
        }
    }
}

/// `base_interval(level) × jitter`, with jitter drawn from `jitter_seed`.
///
/// In burst mode a healthy worker waits roughly `burst_wait`, never less than
/// [`MIN_BURST_WAIT`] and never more than `min_wait`.
pub fn next_delay(
    windows: &ScheduleWindows,
    level: RecoveryLevel,
    burst: bool,
    jitter_seed: u64,
) -> Duration {
    let mut rng = StdRng::seed_from_u64(jitter_seed);

    if burst && level.is_healthy() {
        let jitter: f64 = rng.gen_range(0.8..=1.2);
        let delay = windows.burst_wait.mul_f64(jitter);
        let ceiling = windows.min_wait.max(MIN_BURST_WAIT);
        return delay.clamp(MIN_BURST_WAIT, ceiling);
    }

    let (low, high) = window_or_floor(windows, level);
    let spread = high.as_secs_f64() / low.as_secs_f64();
    let jitter: f64 = rng.gen_range(1.0..=spread.max(1.0));
    low.mul_f64(jitter).clamp(low, high)
}

fn window_or_floor(windows: &ScheduleWindows, level: RecoveryLevel) -> (Duration, Duration) {
    let (low, high) = windows.window(level);
    let low = low.max(Duration::from_millis(1));
    (low, high.max(low))
}

/// Per-worker scheduler state.
pub struct Scheduler {
    windows: ScheduleWindows,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(windows: ScheduleWindows, seed: u64) -> Self {
        Self {
            windows,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next(&mut self, level: RecoveryLevel, burst: bool) -> Duration {
        let seed: u64 = self.rng.gen();
        next_delay(&self.windows, level, burst, seed)
    }
}
