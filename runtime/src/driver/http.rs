// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Plain HTTP driver wrapping reqwest.
//!
//! Polls a listing endpoint and posts acquisitions to a second endpoint.
//! JSON listings of the form `{ "items": [...], "empty": bool }` are parsed
//! into raw items. The body text is always kept for signature matching.
//! No retries here: backoff belongs to the scheduler.

use super::{Action, ActionResult, DriverFactory, RawItem, RawSignal, SessionDriver, TransportFault};
use crate::ids::WorkerId;
use crate::recovery::RecoveryLevel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use url::Url;

/// Bodies longer than this are truncated before classification.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Settings shared by every HTTP session.
#[derive(Debug, Clone)]
pub struct HttpDriverConfig {
    pub listing_url: Url,
    pub acquire_url: Url,
    pub timeout: Duration,
    pub user_agent: String,
    /// Egress proxies; identity rotation moves to the next one.
    pub proxies: Vec<String>,
}

impl HttpDriverConfig {
    pub fn new(listing_url: &str, acquire_url: &str) -> Result<Self> {
        Ok(Self {
            listing_url: Url::parse(listing_url)
                .with_context(|| format!("invalid listing url: {listing_url}"))?,
            acquire_url: Url::parse(acquire_url)
                .with_context(|| format!("invalid acquire url: {acquire_url}"))?,
            timeout: Duration::from_secs(15),
            user_agent: format!("dropwatch/{}", env!("CARGO_PKG_VERSION")),
            proxies: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ListingPayload {
    #[serde(default)]
    items: Vec<RawItem>,
    #[serde(default)]
    empty: Option<bool>,
}

pub struct HttpDriver {
    config: HttpDriverConfig,
    client: reqwest::Client,
    proxy_index: usize,
}

impl HttpDriver {
    pub fn new(config: HttpDriverConfig, proxy_index: usize) -> Result<Self> {
        let client = build_client(&config, proxy_index)?;
        Ok(Self {
            config,
            client,
            proxy_index,
        })
    }

    pub fn proxy_index(&self) -> usize {
        self.proxy_index
    }
}

fn build_client(config: &HttpDriverConfig, proxy_index: usize) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(config.user_agent.as_str())
        .cookie_store(true);
    if !config.proxies.is_empty() {
        let proxy_url = &config.proxies[proxy_index % config.proxies.len()];
        let proxy = reqwest::Proxy::all(proxy_url.as_str())
            .with_context(|| format!("invalid proxy: {proxy_url}"))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("failed to build HTTP client")
}

fn fault_of(err: &reqwest::Error) -> TransportFault {
    if err.is_timeout() {
        TransportFault::Timeout
    } else if err.is_connect() {
        TransportFault::Connect
    } else {
        TransportFault::Reset
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_BODY_BYTES {
        let mut cut = MAX_BODY_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl SessionDriver for HttpDriver {
    async fn poll(&mut self) -> Result<RawSignal> {
        let start = Instant::now();
        let resp = match self.client.get(self.config.listing_url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("listing poll failed: {e}");
                let mut signal = RawSignal::fault(fault_of(&e));
                signal.elapsed_ms = start.elapsed().as_millis() as u64;
                return Ok(signal);
            }
        };

        let status = resp.status().as_u16();
        let body = match resp.text().await {
            Ok(b) => truncate_body(b),
            Err(e) => {
                let mut signal = RawSignal::fault(fault_of(&e));
                signal.status = Some(status);
                signal.elapsed_ms = start.elapsed().as_millis() as u64;
                return Ok(signal);
            }
        };

        let mut signal = RawSignal::page(status, String::new());
        if let Ok(payload) = serde_json::from_str::<ListingPayload>(&body) {
            signal.items = payload
                .items
                .into_iter()
                .enumerate()
                .map(|(i, mut item)| {
                    if item.position == 0 {
                        item.position = i as u32;
                    }
                    item
                })
                .collect();
            signal.empty_indicator = payload.empty;
        }
        signal.body = body;
        signal.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(signal)
    }

    async fn act(&mut self, action: &Action) -> Result<ActionResult> {
        let start = Instant::now();
        let resp = self
            .client
            .post(self.config.acquire_url.clone())
            .json(action)
            .send()
            .await
            .context("acquire request failed")?;
        let status = resp.status();
        let detail = resp.text().await.unwrap_or_default();
        let detail: String = detail.chars().take(200).collect();
        Ok(ActionResult {
            success: status.is_success(),
            detail: if detail.is_empty() {
                Some(status.to_string())
            } else {
                Some(detail)
            },
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn reset(&mut self, level: RecoveryLevel) -> Result<bool> {
        // A fresh client drops the cookie jar and pooled connections.
        match build_client(&self.config, self.proxy_index) {
            Ok(client) => {
                self.client = client;
                tracing::debug!("http session reset at level {level}");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("http session reset failed: {e:#}");
                Ok(false)
            }
        }
    }

    async fn rotate_identity(&mut self) -> Result<bool> {
        let next = self.proxy_index.wrapping_add(1);
        match build_client(&self.config, next) {
            Ok(client) => {
                self.client = client;
                self.proxy_index = next;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("http identity rotation failed: {e:#}");
                Ok(false)
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Opens one HTTP session per worker, spreading workers over the proxies.
pub struct HttpDriverFactory {
    config: HttpDriverConfig,
}

impl HttpDriverFactory {
    pub fn new(config: HttpDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverFactory for HttpDriverFactory {
    async fn open(&self, worker_id: WorkerId) -> Result<Box<dyn SessionDriver>> {
        let driver = HttpDriver::new(self.config.clone(), worker_id.0 as usize)?;
        Ok(Box::new(driver))
    }
}
