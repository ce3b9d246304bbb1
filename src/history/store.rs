// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Append-only storage for confirmed claims. The engine ships an in-memory
//! implementation; anything durable plugs in behind [`ClaimStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use ethers::types::Address as EthAddress;

use crate::error::{ClaimError, ClaimResult};
use crate::types::{ClaimHistoryEntry, ClaimStats, RarityTier, TemplateId};

/// Filter for [`ClaimStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ClaimQuery {
    pub user: Option<EthAddress>,
    pub template_id: Option<TemplateId>,
    pub category: Option<String>,
    pub rarity: Option<RarityTier>,
    /// Inclusive unix-seconds bounds on the claim timestamp.
    pub from_timestamp: Option<u64>,
    pub to_timestamp: Option<u64>,
    /// Result cap, applied after ordering.
    pub limit: Option<usize>,
    /// Reverses the chronological default.
    pub newest_first: bool,
}

impl ClaimQuery {
    /// One user's history the way views render it: latest claim first.
    pub fn for_user(user: EthAddress) -> Self {
        Self {
            user: Some(user),
            newest_first: true,
            ..Default::default()
        }
    }

    fn matches(&self, entry: &ClaimHistoryEntry) -> bool {
        if self.user.is_some_and(|user| entry.user != user) {
            return false;
        }
        if self.template_id.is_some_and(|id| entry.template_id != id) {
            return false;
        }
        if self
            .category
            .as_ref()
            .is_some_and(|category| &entry.collectible.category != category)
        {
            return false;
        }
        if self
            .rarity
            .is_some_and(|rarity| entry.collectible.rarity != rarity)
        {
            return false;
        }
        if self.from_timestamp.is_some_and(|from| entry.timestamp < from) {
            return false;
        }
        if self.to_timestamp.is_some_and(|to| entry.timestamp > to) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Inserts the entry unless its id is already present. Returns whether
    /// the entry was new. Replays of the same claim must be a no-op.
    async fn upsert(&self, entry: ClaimHistoryEntry) -> ClaimResult<bool>;

    async fn contains(&self, id: &str) -> ClaimResult<bool>;

    /// Matching entries in chronological order, reversed when the query
    /// asks for `newest_first`.
    async fn list(&self, query: &ClaimQuery) -> ClaimResult<Vec<ClaimHistoryEntry>>;

    async fn stats(&self, user: EthAddress) -> ClaimResult<ClaimStats>;

    /// Claims per template with `timestamp >= since`, across all users.
    async fn recent_claim_counts(&self, since: u64) -> ClaimResult<HashMap<TemplateId, u64>>;
}

#[derive(Default)]
pub struct MemoryClaimStore {
    entries: RwLock<HashMap<String, ClaimHistoryEntry>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> ClaimError {
    ClaimError::Storage("claim store lock poisoned".to_string())
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn upsert(&self, entry: ClaimHistoryEntry) -> ClaimResult<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if entries.contains_key(&entry.id) {
            return Ok(false);
        }
        entries.insert(entry.id.clone(), entry);
        Ok(true)
    }

    async fn contains(&self, id: &str) -> ClaimResult<bool> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.contains_key(id))
    }

    async fn list(&self, query: &ClaimQuery) -> ClaimResult<Vec<ClaimHistoryEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut matching: Vec<ClaimHistoryEntry> = entries
            .values()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        // Chronological; id as the final key keeps the order stable across
        // entries sharing a block.
        matching.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.block_number.cmp(&b.block_number))
                .then(a.id.cmp(&b.id))
        });
        if query.newest_first {
            matching.reverse();
        }
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn stats(&self, user: EthAddress) -> ClaimResult<ClaimStats> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_rarity: BTreeMap<RarityTier, u64> = BTreeMap::new();
        let mut latest: Option<ClaimHistoryEntry> = None;
        let mut total_claims = 0u64;

        for entry in entries.values().filter(|entry| entry.user == user) {
            total_claims += 1;
            *by_category
                .entry(entry.collectible.category.clone())
                .or_default() += 1;
            *by_rarity.entry(entry.collectible.rarity).or_default() += 1;
            let newer = latest
                .as_ref()
                .map_or(true, |current| entry.timestamp > current.timestamp);
            if newer {
                latest = Some(entry.clone());
            }
        }

        Ok(ClaimStats {
            total_claims,
            by_category,
            by_rarity,
            latest,
        })
    }

    async fn recent_claim_counts(&self, since: u64) -> ClaimResult<HashMap<TemplateId, u64>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut counts: HashMap<TemplateId, u64> = HashMap::new();
        for entry in entries.values().filter(|entry| entry.timestamp >= since) {
            *counts.entry(entry.template_id).or_default() += 1;
        }
        Ok(counts)
    }
}
