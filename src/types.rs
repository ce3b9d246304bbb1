// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::types::{Address as EthAddress, TxHash, U256};
use ethers::utils::keccak256;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// On-chain template id. Ids start at 1; 0 is never a valid template.
pub type TemplateId = u64;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    TryFromPrimitive,
    Display,
)]
#[repr(u8)]
pub enum RarityTier {
    Common = 0,
    Uncommon = 1,
    Rare = 2,
    Epic = 3,
    Legendary = 4,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, Display,
)]
#[repr(u8)]
pub enum EligibilityType {
    /// Anyone may claim.
    Open = 0,
    /// Claimer must be on the template's whitelist.
    Whitelist = 1,
    /// Claimer must hold the template's required token.
    TokenHolder = 2,
    /// Claimer must have a registered profile.
    ProfileRequired = 3,
}

/// One collectible template as read from the registry contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub template_id: TemplateId,
    /// Zero address means the id was never created.
    pub issuer: EthAddress,
    pub category: String,
    pub description: String,
    pub rarity: RarityTier,
    /// 0 means unbounded supply.
    pub max_supply: u64,
    pub current_supply: u64,
    pub tier: u8,
    /// Unix seconds. 0 means no start bound.
    pub start_time: u64,
    /// Unix seconds. 0 means no end bound.
    pub end_time: u64,
    pub is_paused: bool,
    pub eligibility: EligibilityType,
    pub metadata_uri: String,
}

impl Template {
    /// Supply still claimable. `None` for unbounded templates.
    pub fn remaining_supply(&self) -> Option<u64> {
        if self.max_supply == 0 {
            None
        } else {
            Some(self.max_supply.saturating_sub(self.current_supply))
        }
    }

    pub fn is_sold_out(&self) -> bool {
        self.max_supply != 0 && self.current_supply >= self.max_supply
    }

    pub fn has_started(&self, now: u64) -> bool {
        self.start_time == 0 || now >= self.start_time
    }

    /// A template is claimable through `end_time` inclusive.
    pub fn has_ended(&self, now: u64) -> bool {
        self.end_time != 0 && now > self.end_time
    }
}

/// Claimability verdict for one (user, template) pair at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStatus {
    pub has_claimed: bool,
    /// Whether the eligibility requirement itself is satisfied.
    pub is_eligible: bool,
    /// Whether a claim submitted right now would be accepted.
    pub can_claim_now: bool,
    /// Set when `can_claim_now` is false, fit for direct display.
    pub reason: Option<String>,
}

/// One confirmed claim, stored append-only and deduplicated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimHistoryEntry {
    /// Deduplication key, see [`claim_entry_id`].
    pub id: String,
    pub template_id: TemplateId,
    pub user: EthAddress,
    pub tx_hash: TxHash,
    /// Id of the card minted by this claim.
    pub card_id: u64,
    /// Chain timestamp of the claim, unix seconds.
    pub timestamp: u64,
    pub block_number: u64,
    /// Template snapshot taken when the entry was ingested.
    pub collectible: Template,
}

/// Aggregate view over a user's claim history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimStats {
    pub total_claims: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_rarity: BTreeMap<RarityTier, u64>,
    pub latest: Option<ClaimHistoryEntry>,
}

/// Component scores backing the trending ranking, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendingScore {
    pub claim_velocity: f64,
    pub scarcity: f64,
    pub urgency: f64,
}

/// Deterministic identity of one claim: keccak256 over the template id as
/// a 32-byte big-endian word, the 20-byte claimer address and the 32-byte
/// transaction hash, hex-encoded with a 0x prefix.
pub fn claim_entry_id(template_id: TemplateId, user: EthAddress, tx_hash: TxHash) -> String {
    let mut preimage = [0u8; 84];
    U256::from(template_id).to_big_endian(&mut preimage[..32]);
    preimage[32..52].copy_from_slice(user.as_bytes());
    preimage[52..84].copy_from_slice(tx_hash.as_bytes());
    format!("0x{}", hex::encode(keccak256(preimage)))
}

/// Current unix time in seconds. 0 only on hosts with a pre-epoch clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_entry_id_is_deterministic() {
        let user = EthAddress::repeat_byte(0x11);
        let tx = TxHash::repeat_byte(0x22);
        assert_eq!(claim_entry_id(5, user, tx), claim_entry_id(5, user, tx));
    }

    #[test]
    fn test_claim_entry_id_distinguishes_every_field() {
        let user = EthAddress::repeat_byte(0x11);
        let other_user = EthAddress::repeat_byte(0x12);
        let tx = TxHash::repeat_byte(0x22);
        let other_tx = TxHash::repeat_byte(0x23);

        let base = claim_entry_id(5, user, tx);
        assert_ne!(base, claim_entry_id(6, user, tx));
        assert_ne!(base, claim_entry_id(5, other_user, tx));
        assert_ne!(base, claim_entry_id(5, user, other_tx));
    }

    #[test]
    fn test_claim_entry_id_shape() {
        let id = claim_entry_id(1, EthAddress::zero(), TxHash::zero());
        assert!(id.starts_with("0x"));
        // 32-byte digest, hex-encoded.
        assert_eq!(id.len(), 2 + 64);
    }

    #[test]
    fn test_rarity_ordering_and_display() {
        assert!(RarityTier::Common < RarityTier::Uncommon);
        assert!(RarityTier::Epic < RarityTier::Legendary);
        assert_eq!(RarityTier::Legendary.to_string(), "Legendary");
    }

    #[test]
    fn test_unknown_discriminants_are_rejected() {
        assert!(RarityTier::try_from(5u8).is_err());
        assert!(EligibilityType::try_from(4u8).is_err());
        assert_eq!(RarityTier::try_from(2u8).unwrap(), RarityTier::Rare);
        assert_eq!(
            EligibilityType::try_from(3u8).unwrap(),
            EligibilityType::ProfileRequired
        );
    }

    #[test]
    fn test_supply_helpers() {
        let mut template = crate::test_utils::test_template(1);
        template.max_supply = 10;
        template.current_supply = 10;
        assert!(template.is_sold_out());
        assert_eq!(template.remaining_supply(), Some(0));

        template.current_supply = 4;
        assert!(!template.is_sold_out());
        assert_eq!(template.remaining_supply(), Some(6));

        template.max_supply = 0;
        assert!(!template.is_sold_out());
        assert_eq!(template.remaining_supply(), None);
    }

    #[test]
    fn test_time_window_helpers() {
        let mut template = crate::test_utils::test_template(1);
        template.start_time = 100;
        template.end_time = 200;
        assert!(!template.has_started(99));
        assert!(template.has_started(100));
        assert!(!template.has_ended(200));
        assert!(template.has_ended(201));

        template.start_time = 0;
        template.end_time = 0;
        assert!(template.has_started(0));
        assert!(!template.has_ended(u64::MAX));
    }
}
