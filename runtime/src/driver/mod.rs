// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session driver abstraction.
//!
//! Defines the `SessionDriver` and `DriverFactory` traits that abstract over
//! whatever observes and acts on the watched resource. The engine never
//! builds a session itself; the pool asks a factory for one per worker.

pub mod http;
pub mod scripted;

use crate::ids::WorkerId;
use crate::recovery::RecoveryLevel;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Why a poll never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportFault {
    Timeout,
    Connect,
    Reset,
}

/// One listing entry as the driver saw it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawItem {
    pub label: String,
    pub category_hint: Option<String>,
    pub price: Option<f64>,
    /// Driver-supplied quality estimate in `0.0..=1.0`.
    pub quality: Option<f32>,
    /// Position on the page, 0 = first.
    pub position: u32,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl RawItem {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_category(mut self, hint: impl Into<String>) -> Self {
        self.category_hint = Some(hint.into());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

/// Everything a single poll observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSignal {
    /// Response status, `None` if no response arrived.
    pub status: Option<u16>,
    /// Page text used for signature matching.
    pub body: String,
    pub items: Vec<RawItem>,
    /// The resource's own "nothing available" indicator, when it has one.
    pub empty_indicator: Option<bool>,
    pub fault: Option<TransportFault>,
    pub elapsed_ms: u64,
}

impl RawSignal {
    pub fn with_items(items: Vec<RawItem>) -> Self {
        Self {
            status: Some(200),
            items,
            ..Default::default()
        }
    }

    /// Empty page without any authoritative "sold out" marker.
    pub fn ambiguous_empty() -> Self {
        Self {
            status: Some(200),
            ..Default::default()
        }
    }

    pub fn genuinely_empty() -> Self {
        Self {
            status: Some(200),
            empty_indicator: Some(true),
            ..Default::default()
        }
    }

    pub fn page(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn fault(fault: TransportFault) -> Self {
        Self {
            fault: Some(fault),
            ..Default::default()
        }
    }
}

/// An interaction the worker asks the driver to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    /// Acquire the opportunity the worker holds a claim on.
    Acquire {
        opportunity_id: String,
        label: String,
        price: Option<f64>,
        attributes: serde_json::Map<String, serde_json::Value>,
    },
}

/// Result of executing an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

impl ActionResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            detail: None,
            elapsed_ms: 0,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
            elapsed_ms: 0,
        }
    }
}

/// One isolated session against the watched resource.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Observe the resource once.
    async fn poll(&mut self) -> Result<RawSignal>;
    /// Perform an interaction (acquisition) on the resource.
    async fn act(&mut self, action: &Action) -> Result<ActionResult>;
    /// Wipe local session state for the given recovery level.
    /// `Ok(false)` means the driver could not honour the request.
    async fn reset(&mut self, level: RecoveryLevel) -> Result<bool>;
    /// Switch to a fresh identity (cookies, egress binding).
    async fn rotate_identity(&mut self) -> Result<bool>;
    /// Release the session.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens sessions for newly spawned workers.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self, worker_id: WorkerId) -> Result<Box<dyn SessionDriver>>;
}
