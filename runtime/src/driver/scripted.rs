// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scripted driver: replays a fixed sequence of poll results.
//!
//! Used by the test suite and by `dropwatch simulate` to exercise the engine
//! without touching a real resource.

use super::{Action, ActionResult, DriverFactory, RawSignal, SessionDriver};
use crate::ids::WorkerId;
use crate::recovery::RecoveryLevel;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What one scripted session does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    /// Poll results, in order.
    pub polls: Vec<RawSignal>,
    /// Returned once `polls` is exhausted (and `repeat` is off).
    pub then: RawSignal,
    /// Cycle through `polls` forever.
    pub repeat: bool,
    /// Acquisition outcomes, in order; `true` once exhausted.
    pub act_results: Vec<bool>,
    pub poll_delay_ms: u64,
    pub act_delay_ms: u64,
    pub reset_ok: bool,
    pub rotate_ok: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            polls: Vec::new(),
            then: RawSignal::genuinely_empty(),
            repeat: false,
            act_results: Vec::new(),
            poll_delay_ms: 0,
            act_delay_ms: 0,
            reset_ok: true,
            rotate_ok: true,
        }
    }
}

impl Script {
    pub fn new(polls: Vec<RawSignal>) -> Self {
        Self {
            polls,
            ..Default::default()
        }
    }

    pub fn repeating(polls: Vec<RawSignal>) -> Self {
        Self {
            polls,
            repeat: true,
            ..Default::default()
        }
    }

    pub fn then(mut self, signal: RawSignal) -> Self {
        self.then = signal;
        self
    }

    pub fn with_act_results(mut self, results: Vec<bool>) -> Self {
        self.act_results = results;
        self
    }

    pub fn with_act_delay(mut self, delay: Duration) -> Self {
        self.act_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn refusing_reset(mut self) -> Self {
        self.reset_ok = false;
        self
    }
}

/// Counters a test can inspect while the driver is owned by a worker.
#[derive(Debug, Default)]
pub struct ScriptProbe {
    pub polls: AtomicU64,
    pub acts: AtomicU64,
    pub resets: AtomicU64,
    pub rotations: AtomicU64,
    pub closed: AtomicBool,
    acted_on: Mutex<Vec<String>>,
}

impl ScriptProbe {
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn acts(&self) -> u64 {
        self.acts.load(Ordering::SeqCst)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Opportunity ids this session tried to acquire.
    pub fn acted_on(&self) -> Vec<String> {
        self.acted_on
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

pub struct ScriptedDriver {
    script: Script,
    cursor: usize,
    acts: VecDeque<bool>,
    probe: Arc<ScriptProbe>,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        Self::with_probe(script, Arc::new(ScriptProbe::default()))
    }

    pub fn with_probe(script: Script, probe: Arc<ScriptProbe>) -> Self {
        let acts = script.act_results.iter().copied().collect();
        Self {
            script,
            cursor: 0,
            acts,
            probe,
        }
    }

    pub fn probe(&self) -> Arc<ScriptProbe> {
        Arc::clone(&self.probe)
    }

    fn next_signal(&mut self) -> RawSignal {
        let polls = &self.script.polls;
        if polls.is_empty() {
            return self.script.then.clone();
        }
        if self.cursor < polls.len() {
            let signal = polls[self.cursor].clone();
            self.cursor += 1;
            return signal;
        }
        if self.script.repeat {
            self.cursor = 1;
            return polls[0].clone();
        }
        self.script.then.clone()
    }
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    async fn poll(&mut self) -> Result<RawSignal> {
        if self.probe.is_closed() {
            bail!("scripted session already closed");
        }
        if self.script.poll_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.poll_delay_ms)).await;
        }
        self.probe.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_signal())
    }

    async fn act(&mut self, action: &Action) -> Result<ActionResult> {
        self.probe.acts.fetch_add(1, Ordering::SeqCst);
        let Action::Acquire { opportunity_id, .. } = action;
        if let Ok(mut acted) = self.probe.acted_on.lock() {
            acted.push(opportunity_id.clone());
        }
        if self.script.act_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.act_delay_ms)).await;
        }
        if self.acts.pop_front().unwrap_or(true) {
            Ok(ActionResult::succeeded())
        } else {
            Ok(ActionResult::failed("scripted rejection"))
        }
    }

    async fn reset(&mut self, _level: RecoveryLevel) -> Result<bool> {
        self.probe.resets.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.reset_ok)
    }

    async fn rotate_identity(&mut self) -> Result<bool> {
        self.probe.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.rotate_ok)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out scripts in spawn order, falling back to a default script.
pub struct ScriptedFactory {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    opened: Mutex<Vec<(WorkerId, Arc<ScriptProbe>)>>,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<Script>, fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Every session gets the same script.
    pub fn uniform(script: Script) -> Self {
        Self::new(Vec::new(), script)
    }

    /// Probes of every session opened so far, in open order.
    pub fn probes(&self) -> Vec<(WorkerId, Arc<ScriptProbe>)> {
        self.opened.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn probe_for(&self, worker_id: WorkerId) -> Option<Arc<ScriptProbe>> {
        self.probes()
            .into_iter()
            .find(|(id, _)| *id == worker_id)
            .map(|(_, probe)| probe)
    }
}

#[async_trait]
impl DriverFactory for ScriptedFactory {
    async fn open(&self, worker_id: WorkerId) -> Result<Box<dyn SessionDriver>> {
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        let probe = Arc::new(ScriptProbe::default());
        if let Ok(mut opened) = self.opened.lock() {
            opened.push((worker_id, Arc::clone(&probe)));
        }
        Ok(Box::new(ScriptedDriver::with_probe(script, probe)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawItem;

    #[tokio::test]
    async fn test_script_plays_in_order_then_falls_back() {
        let mut driver = ScriptedDriver::new(Script::new(vec![
            RawSignal::ambiguous_empty(),
            RawSignal::with_items(vec![RawItem::new("a")]),
        ]));
        assert!(driver.poll().await.unwrap().items.is_empty());
        assert_eq!(driver.poll().await.unwrap().items.len(), 1);
        let fallback = driver.poll().await.unwrap();
        assert_eq!(fallback.empty_indicator, Some(true));
        assert_eq!(driver.probe().polls(), 3);
    }

    #[tokio::test]
    async fn test_repeating_script_cycles() {
        let mut driver = ScriptedDriver::new(Script::repeating(vec![
            RawSignal::page(403, ""),
            RawSignal::page(200, ""),
        ]));
        let statuses: Vec<_> = [
            driver.poll().await.unwrap(),
            driver.poll().await.unwrap(),
            driver.poll().await.unwrap(),
        ]
        .into_iter()
        .map(|s| s.status)
        .collect();
        assert_eq!(statuses, vec![Some(403), Some(200), Some(403)]);
    }

    #[tokio::test]
    async fn test_act_results_sequence() {
        let mut driver =
            ScriptedDriver::new(Script::default().with_act_results(vec![false]));
        let action = Action::Acquire {
            opportunity_id: "x".into(),
            label: "x".into(),
            price: None,
            attributes: Default::default(),
        };
        assert!(!driver.act(&action).await.unwrap().success);
        assert!(driver.act(&action).await.unwrap().success);
        assert_eq!(driver.probe().acted_on(), vec!["x", "x"]);
    }

    #[tokio::test]
    async fn test_factory_tracks_probes_and_close() {
        let factory = ScriptedFactory::new(
            vec![Script::default().refusing_reset()],
            Script::default(),
        );
        let mut first = factory.open(WorkerId(1)).await.unwrap();
        let mut second = factory.open(WorkerId(2)).await.unwrap();
        assert!(!first.reset(RecoveryLevel::new(1)).await.unwrap());
        assert!(second.reset(RecoveryLevel::new(1)).await.unwrap());

        first.close().await.unwrap();
        assert!(factory.probe_for(WorkerId(1)).unwrap().is_closed());
        assert!(!factory.probe_for(WorkerId(2)).unwrap().is_closed());
    }
}
