// Copyright 2026 Dropwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Opportunity deduplication and scoring.
//!
//! Raw items are normalized (volatile keys stripped, strings trimmed and
//! lower-cased, keys sorted) and hashed into an identity. Price, quality and
//! position are material attributes: they feed the score but not the
//! identity, so a price change re-scores an entry instead of duplicating it.
//!
//! ```text
//! score = w_category[category]
//!       + w_price    × ref / (ref + price)
//!       + w_position × 1 / (1 + position)
//!       + w_quality  × quality
//! ```

use crate::config::ScoringConfig;
use crate::driver::RawItem;
use crate::ids::{OpportunityId, WorkerId};
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hasher;
use std::time::{Duration, Instant};

/// Attribute keys that never take part in identity.
const MATERIAL_KEYS: [&str; 3] = ["price", "quality", "position"];

/// Closed category taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Premium,
    Standard,
    Economy,
    Unknown,
}

/// A tracked opportunity.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub category: Category,
    pub label: String,
    pub price: Option<f64>,
    pub quality: Option<f32>,
    pub position: u32,
    pub raw_attributes: Map<String, Value>,
    pub score: f64,
    pub first_seen_at: Instant,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_at: Instant,
    pub discovered_by: WorkerId,
    pub claimed: bool,
    /// Insertion order, the last tie-breaker.
    seq: u64,
}

/// Immutable snapshot handed out of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityView {
    pub id: OpportunityId,
    pub category: Category,
    pub label: String,
    pub price: Option<f64>,
    pub score: f64,
    pub first_seen_at: DateTime<Utc>,
    pub discovered_by: WorkerId,
    pub attributes: Map<String, Value>,
}

impl Opportunity {
    pub fn view(&self) -> OpportunityView {
        OpportunityView {
            id: self.id.clone(),
            category: self.category,
            label: self.label.clone(),
            price: self.price,
            score: self.score,
            first_seen_at: self.first_seen_utc,
            discovered_by: self.discovered_by,
            attributes: self.raw_attributes.clone(),
        }
    }

    /// Higher score first, then earliest sighting, then insertion order.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.first_seen_at.cmp(&other.first_seen_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Canonical identity form of a raw item.
pub fn normalize(item: &RawItem, volatile_keys: &[String]) -> Value {
    let mut attributes = BTreeMap::new();
    for (key, value) in &item.attributes {
        let lower = key.to_ascii_lowercase();
        if is_volatile(&lower, volatile_keys) || MATERIAL_KEYS.contains(&lower.as_str()) {
            continue;
        }
        attributes.insert(lower, canonical(value, volatile_keys));
    }

    serde_json::json!({
        "label": normalize_text(&item.label),
        "category": item.category_hint.as_deref().map(normalize_text),
        "attributes": attributes,
    })
}

/// FNV-1a 64 over the canonical JSON form.
pub fn identity_hash(item: &RawItem, volatile_keys: &[String]) -> OpportunityId {
    let canonical = normalize(item, volatile_keys);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = FnvHasher::default();
    hasher.write(&bytes);
    OpportunityId::from_hash(hasher.finish())
}

fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_volatile(key: &str, volatile_keys: &[String]) -> bool {
    volatile_keys.iter().any(|v| v.eq_ignore_ascii_case(key))
}

fn canonical(value: &Value, volatile_keys: &[String]) -> Value {
    match value {
        Value::String(s) => Value::String(normalize_text(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| canonical(v, volatile_keys))
                .collect(),
        ),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .filter(|(k, _)| !is_volatile(k, volatile_keys))
                .map(|(k, v)| (k.to_ascii_lowercase(), canonical(v, volatile_keys)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        other => other.clone(),
    }
}

/// Category resolution and score computation from the scoring table.
#[derive(Debug, Clone)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn volatile_keys(&self) -> &[String] {
        &self.config.volatile_keys
    }

    pub fn categorize(&self, hint: Option<&str>) -> Category {
        hint.map(normalize_text)
            .and_then(|h| self.config.category_aliases.get(&h).copied())
            .unwrap_or(Category::Unknown)
    }

    pub fn score(
        &self,
        category: Category,
        price: Option<f64>,
        position: u32,
        quality: Option<f32>,
    ) -> f64 {
        let c = &self.config;
        let inverse_price = match price {
            Some(p) if p.is_finite() && p >= 0.0 => c.price_reference / (c.price_reference + p),
            _ => 0.0,
        };
        let positional = 1.0 / (1.0 + position as f64);
        let quality = quality.map(|q| q.clamp(0.0, 1.0) as f64).unwrap_or(0.0);

        c.category_weights.weight(category)
            + c.inverse_price * inverse_price
            + c.position * positional
            + c.quality * quality
    }
}

/// Result of feeding one poll's items through the table.
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    /// Newly tracked opportunities.
    pub discovered: Vec<OpportunityView>,
    /// Tracked opportunities whose material attributes changed: `(view, old_score)`.
    pub rescored: Vec<(OpportunityView, f64)>,
    /// Every live id seen in this batch, in order, without repeats.
    pub seen: Vec<OpportunityId>,
    pub duplicates: usize,
    pub tombstoned: usize,
}

/// Tracked opportunities keyed by identity hash.
///
/// Not synchronized on its own; the coordinator owns it behind its lock.
pub struct OpportunityTable {
    scorer: Scorer,
    entries: HashMap<OpportunityId, Opportunity>,
    /// Identities already acquired this run.
    tombstones: HashSet<OpportunityId>,
    next_seq: u64,
}

impl OpportunityTable {
    pub fn new(scorer: Scorer) -> Self {
        Self {
            scorer,
            entries: HashMap::new(),
            tombstones: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn get(&self, id: &OpportunityId) -> Option<&Opportunity> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &OpportunityId) -> Option<&mut Opportunity> {
        self.entries.get_mut(id)
    }

    pub fn is_tombstoned(&self, id: &OpportunityId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn ingest(&mut self, worker: WorkerId, items: &[RawItem], now: Instant) -> IngestReport {
        let mut report = IngestReport::default();
        let mut batch: HashSet<OpportunityId> = HashSet::new();

        for item in items {
            let id = identity_hash(item, self.scorer.volatile_keys());
            if self.tombstones.contains(&id) {
                report.tombstoned += 1;
                continue;
            }
            if !batch.insert(id.clone()) {
                report.duplicates += 1;
                continue;
            }
            report.seen.push(id.clone());

            if let Some(existing) = self.entries.get_mut(&id) {
                existing.last_seen_at = now;
                let price_changed = !same_price(existing.price, item.price);
                let quality_changed = existing.quality != item.quality;
                let position_changed = existing.position != item.position;
                if price_changed || quality_changed || position_changed {
                    let old_score = existing.score;
                    existing.price = item.price;
                    existing.quality = item.quality;
                    existing.position = item.position;
                    existing.score = self.scorer.score(
                        existing.category,
                        existing.price,
                        existing.position,
                        existing.quality,
                    );
                    report.rescored.push((existing.view(), old_score));
                } else {
                    report.duplicates += 1;
                }
                continue;
            }

            let category = self.scorer.categorize(item.category_hint.as_deref());
            let score = self
                .scorer
                .score(category, item.price, item.position, item.quality);
            let opportunity = Opportunity {
                id: id.clone(),
                category,
                label: item.label.clone(),
                price: item.price,
                quality: item.quality,
                position: item.position,
                raw_attributes: item.attributes.clone(),
                score,
                first_seen_at: now,
                first_seen_utc: Utc::now(),
                last_seen_at: now,
                discovered_by: worker,
                claimed: false,
                seq: self.next_seq,
            };
            self.next_seq += 1;
            report.discovered.push(opportunity.view());
            self.entries.insert(id, opportunity);
        }

        report
    }

    /// Unclaimed opportunities among `ids`, best first.
    pub fn ranked(&self, ids: &[OpportunityId]) -> Vec<OpportunityView> {
        let mut candidates: Vec<&Opportunity> = ids
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|o| !o.claimed)
            .collect();
        candidates.sort_by(|a, b| a.rank_cmp(b));
        candidates.into_iter().map(Opportunity::view).collect()
    }

    /// Remember an acquired identity and stop tracking it.
    pub fn tombstone(&mut self, id: &OpportunityId) -> Option<Opportunity> {
        self.tombstones.insert(id.clone());
        self.entries.remove(id)
    }

    /// Drop unclaimed entries not seen for longer than `ttl`.
    pub fn purge_expired(&mut self, now: Instant, ttl: Duration) -> Vec<OpportunityId> {
        let expired: Vec<OpportunityId> = self
            .entries
            .values()
            .filter(|o| !o.claimed && now.saturating_duration_since(o.last_seen_at) > ttl)
            .map(|o| o.id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

fn same_price(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-9,
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> OpportunityTable {
        OpportunityTable::new(Scorer::new(ScoringConfig::default()))
    }

    fn keys() -> Vec<String> {
        ScoringConfig::default().volatile_keys
    }

    #[test]
    fn test_identity_ignores_volatile_and_material_fields() {
        let a = RawItem::new("  Row 12 Seat 4 ")
            .with_price(50.0)
            .with_attribute("timestamp", json!(1700000000))
            .with_attribute("section", json!("North"));
        let b = RawItem::new("row 12 seat 4")
            .with_price(65.0)
            .with_attribute("timestamp", json!(1700000999))
            .with_attribute("Section", json!("north "));
        assert_eq!(identity_hash(&a, &keys()), identity_hash(&b, &keys()));

        let c = RawItem::new("row 12 seat 5").with_attribute("section", json!("north"));
        assert_ne!(identity_hash(&a, &keys()), identity_hash(&c, &keys()));
    }

    #[test]
    fn test_nested_volatile_keys_are_stripped() {
        let a = RawItem::new("x").with_attribute("meta", json!({"nonce": 1, "zone": "A"}));
        let b = RawItem::new("x").with_attribute("meta", json!({"nonce": 2, "zone": "a"}));
        assert_eq!(identity_hash(&a, &keys()), identity_hash(&b, &keys()));
    }

    #[test]
    fn test_reingest_is_idempotent() {
        let mut t = table();
        let item = RawItem::new("a").with_price(10.0);
        let now = Instant::now();
        let first = t.ingest(WorkerId(1), &[item.clone()], now);
        let second = t.ingest(WorkerId(2), &[item.clone(), item], now);
        assert_eq!(first.discovered.len(), 1);
        assert!(second.discovered.is_empty());
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.seen.len(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_price_change_rescores() {
        let mut t = table();
        let now = Instant::now();
        t.ingest(WorkerId(1), &[RawItem::new("a").with_price(100.0)], now);
        let report = t.ingest(WorkerId(1), &[RawItem::new("a").with_price(20.0)], now);
        assert_eq!(report.rescored.len(), 1);
        let (view, old) = &report.rescored[0];
        assert!(view.score > *old);
        assert_eq!(view.price, Some(20.0));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_position_change_rescores() {
        let mut t = table();
        let now = Instant::now();
        let mut low = RawItem::new("b");
        low.position = 9;
        t.ingest(WorkerId(1), &[low], now);

        let report = t.ingest(WorkerId(2), &[RawItem::new("b")], now);
        assert_eq!(report.rescored.len(), 1);
        assert_eq!(report.duplicates, 0);
        let (view, old) = &report.rescored[0];
        assert!(view.score > *old);
        assert_eq!(t.get(&view.id).unwrap().position, 0);
    }

    #[test]
    fn test_category_from_alias_table() {
        let scorer = Scorer::new(ScoringConfig::default());
        assert_eq!(scorer.categorize(Some(" VIP ")), Category::Premium);
        assert_eq!(scorer.categorize(Some("budget")), Category::Economy);
        assert_eq!(scorer.categorize(Some("mystery")), Category::Unknown);
        assert_eq!(scorer.categorize(None), Category::Unknown);
    }

    #[test]
    fn test_score_components() {
        let scorer = Scorer::new(ScoringConfig::default());
        // premium 3.0 + price 100/(100+100)=0.5 + position 0.5*1 + quality 0.5*1
        let s = scorer.score(Category::Premium, Some(100.0), 0, Some(1.0));
        assert!((s - 4.5).abs() < 1e-9);
        let cheaper = scorer.score(Category::Premium, Some(10.0), 0, Some(1.0));
        assert!(cheaper > s);
        let unpriced = scorer.score(Category::Unknown, None, 1, None);
        assert!((unpriced - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_ranking_orders_by_score_then_first_seen() {
        let mut t = table();
        let t0 = Instant::now();
        let early = t.ingest(WorkerId(1), &[RawItem::new("early").with_category("standard")], t0);
        let late = t.ingest(
            WorkerId(1),
            &[RawItem::new("late").with_category("standard")],
            t0 + Duration::from_millis(5),
        );
        let best = t.ingest(
            WorkerId(1),
            &[RawItem::new("best").with_category("premium")],
            t0 + Duration::from_millis(10),
        );

        let ids = vec![
            late.seen[0].clone(),
            early.seen[0].clone(),
            best.seen[0].clone(),
        ];
        let labels: Vec<String> = t.ranked(&ids).into_iter().map(|v| v.label).collect();
        assert_eq!(labels, vec!["best", "early", "late"]);
    }

    #[test]
    fn test_ranked_skips_claimed() {
        let mut t = table();
        let report = t.ingest(WorkerId(1), &[RawItem::new("a"), RawItem::new("b")], Instant::now());
        t.get_mut(&report.seen[0]).unwrap().claimed = true;
        let ranked = t.ranked(&report.seen);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].label, "b");
    }

    #[test]
    fn test_tombstone_blocks_rediscovery() {
        let mut t = table();
        let item = RawItem::new("a");
        let report = t.ingest(WorkerId(1), &[item.clone()], Instant::now());
        t.tombstone(&report.seen[0]);
        let again = t.ingest(WorkerId(2), &[item], Instant::now());
        assert!(again.discovered.is_empty());
        assert_eq!(again.tombstoned, 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_purge_expired_keeps_claimed_and_fresh() {
        let mut t = table();
        let t0 = Instant::now();
        let report = t.ingest(
            WorkerId(1),
            &[RawItem::new("old"), RawItem::new("claimed")],
            t0,
        );
        t.get_mut(&report.seen[1]).unwrap().claimed = true;
        t.ingest(WorkerId(1), &[RawItem::new("fresh")], t0 + Duration::from_secs(50));

        let purged = t.purge_expired(t0 + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(purged, vec![report.seen[0].clone()]);
        assert_eq!(t.len(), 2);
    }
}
