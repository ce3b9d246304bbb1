// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: canned templates and claim entries, registry call
//! presets for [`MockClaimProvider`], and scriptable signer/oracle stubs.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Bytes, Log, Signature, TransactionReceipt, TxHash, H256, U256, U64,
};

use crate::chain_reader::{
    claim_event_filter, get_all_template_ids_calldata, get_template_calldata,
    has_claimed_calldata, ClaimSigner,
};
use crate::eligibility::MembershipOracle;
use crate::error::{ClaimError, ClaimResult};
use crate::events::CARD_CLAIMED_TOPIC;
use crate::mock_provider::MockClaimProvider;
use crate::types::{
    claim_entry_id, ClaimHistoryEntry, EligibilityType, RarityTier, Template, TemplateId,
};

/// A live, open, bounded template. Tests override the fields they care
/// about.
pub fn test_template(template_id: TemplateId) -> Template {
    Template {
        template_id,
        issuer: EthAddress::repeat_byte(0x99),
        category: "collectible".to_string(),
        description: format!("test template {template_id}"),
        rarity: RarityTier::Common,
        max_supply: 100,
        current_supply: 0,
        tier: 1,
        start_time: 100,
        end_time: 200,
        is_paused: false,
        eligibility: EligibilityType::Open,
        metadata_uri: format!("ipfs://collectible/{template_id}"),
    }
}

pub fn test_entry(
    template_id: TemplateId,
    user: EthAddress,
    tx_hash: TxHash,
    timestamp: u64,
) -> ClaimHistoryEntry {
    ClaimHistoryEntry {
        id: claim_entry_id(template_id, user, tx_hash),
        template_id,
        user,
        tx_hash,
        card_id: 900 + template_id,
        timestamp,
        block_number: timestamp / 12,
        collectible: test_template(template_id),
    }
}

/// The `getTemplate` return tuple for `template`, in declaration order.
fn template_return_data(template: &Template) -> Bytes {
    abi::encode(&[
        Token::Address(template.issuer),
        Token::String(template.category.clone()),
        Token::String(template.description.clone()),
        Token::Uint(U256::from(template.rarity as u8)),
        Token::Uint(U256::from(template.max_supply)),
        Token::Uint(U256::from(template.current_supply)),
        Token::Uint(U256::from(template.tier)),
        Token::Uint(U256::from(template.start_time)),
        Token::Uint(U256::from(template.end_time)),
        Token::Bool(template.is_paused),
        Token::Uint(U256::from(template.eligibility as u8)),
        Token::String(template.metadata_uri.clone()),
    ])
    .into()
}

pub fn preset_template(provider: &MockClaimProvider, template: &Template) {
    provider
        .add_call_response::<_, Bytes>(
            &get_template_calldata(template.template_id),
            template_return_data(template),
        )
        .unwrap();
}

/// Makes `template_id` resolve to the registry's zero-issuer sentinel.
pub fn preset_template_not_found(provider: &MockClaimProvider, template_id: TemplateId) {
    let mut gone = test_template(template_id);
    gone.issuer = EthAddress::zero();
    provider
        .add_call_response::<_, Bytes>(&get_template_calldata(template_id), template_return_data(&gone))
        .unwrap();
}

/// Return data too short to be a template tuple.
pub fn preset_malformed_template(provider: &MockClaimProvider, template_id: TemplateId) {
    provider
        .add_call_response::<_, Bytes>(
            &get_template_calldata(template_id),
            Bytes::from(vec![0x01, 0x02, 0x03]),
        )
        .unwrap();
}

pub fn preset_template_ids(provider: &MockClaimProvider, ids: &[TemplateId]) {
    let ids = ids
        .iter()
        .map(|id| Token::Uint(U256::from(*id)))
        .collect::<Vec<_>>();
    provider
        .add_call_response::<_, Bytes>(
            &get_all_template_ids_calldata(),
            Bytes::from(abi::encode(&[Token::Array(ids)])),
        )
        .unwrap();
}

pub fn preset_has_claimed(
    provider: &MockClaimProvider,
    template_id: TemplateId,
    user: EthAddress,
    claimed: bool,
) {
    provider
        .add_call_response::<_, Bytes>(
            &has_claimed_calldata(template_id, user),
            Bytes::from(abi::encode(&[Token::Bool(claimed)])),
        )
        .unwrap();
}

/// A well-formed `CardClaimed` log as the registry contract emits it.
pub fn card_claimed_log(
    contract: EthAddress,
    template_id: TemplateId,
    claimer: EthAddress,
    card_id: u64,
    timestamp: u64,
    block_number: u64,
    tx_hash: TxHash,
) -> Log {
    Log {
        address: contract,
        topics: vec![
            *CARD_CLAIMED_TOPIC,
            H256::from_low_u64_be(template_id),
            H256::from(claimer),
        ],
        data: Bytes::from(abi::encode(&[
            Token::Uint(U256::from(card_id)),
            Token::Uint(U256::from(timestamp)),
        ])),
        block_number: Some(block_number.into()),
        transaction_hash: Some(tx_hash),
        ..Default::default()
    }
}

/// Presets the log query response for the exact filter the reader builds.
pub fn preset_claim_logs(
    provider: &MockClaimProvider,
    registry: EthAddress,
    user: Option<EthAddress>,
    start_block: u64,
    end_block: u64,
    logs: Vec<Log>,
) {
    let filter = claim_event_filter(registry, user, start_block, end_block);
    provider
        .add_response::<_, _, Vec<Log>>("eth_getLogs", [filter], logs)
        .unwrap();
}

pub fn preset_latest_block(provider: &MockClaimProvider, block_number: u64) {
    provider
        .add_response("eth_blockNumber", (), U64::from(block_number))
        .unwrap();
}

/// Presets every RPC a claim submission makes, through broadcast. The
/// receipt is deliberately not preset; pair with [`preset_receipt`] or
/// leave the confirmation watch polling.
pub fn preset_submission(provider: &MockClaimProvider, tx_hash: TxHash) {
    provider
        .add_wildcard_response("eth_getTransactionCount", U256::zero())
        .unwrap();
    provider
        .add_response("eth_gasPrice", (), U256::from(1_000_000_000u64))
        .unwrap();
    provider
        .add_response("eth_chainId", (), U256::from(31_337u64))
        .unwrap();
    provider
        .add_wildcard_response("eth_estimateGas", U256::from(90_000u64))
        .unwrap();
    provider
        .add_wildcard_response("eth_sendRawTransaction", tx_hash)
        .unwrap();
}

pub fn preset_receipt(
    provider: &MockClaimProvider,
    tx_hash: TxHash,
    receipt: &TransactionReceipt,
) {
    provider
        .add_response::<_, _, TransactionReceipt>("eth_getTransactionReceipt", [tx_hash], receipt)
        .unwrap();
}

/// A successful receipt carrying one `CardClaimed` emission.
pub fn claim_receipt(
    tx_hash: TxHash,
    registry: EthAddress,
    template_id: TemplateId,
    claimer: EthAddress,
    card_id: u64,
    timestamp: u64,
    block_number: u64,
) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        block_number: Some(block_number.into()),
        status: Some(1.into()),
        logs: vec![card_claimed_log(
            registry,
            template_id,
            claimer,
            card_id,
            timestamp,
            block_number,
            tx_hash,
        )],
        ..Default::default()
    }
}

/// A reverted receipt.
pub fn failed_receipt(tx_hash: TxHash) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        block_number: Some(42.into()),
        status: Some(0.into()),
        ..Default::default()
    }
}

/// A successful receipt with no `CardClaimed` emission.
pub fn empty_receipt(tx_hash: TxHash) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        block_number: Some(42.into()),
        status: Some(1.into()),
        ..Default::default()
    }
}

/// In-memory wallet with a fixed key, so addresses are stable across runs.
#[derive(Debug, Clone)]
pub struct TestSigner {
    wallet: LocalWallet,
}

impl TestSigner {
    pub fn new() -> Self {
        Self::from_static_key("4242424242424242424242424242424242424242424242424242424242424242")
    }

    /// A second wallet with a distinct address.
    pub fn other() -> Self {
        Self::from_static_key("4343434343434343434343434343434343434343434343434343434343434343")
    }

    fn from_static_key(key: &str) -> Self {
        let wallet = key.parse::<LocalWallet>().expect("static test key is valid");
        Self { wallet }
    }
}

#[async_trait]
impl ClaimSigner for TestSigner {
    fn address(&self) -> EthAddress {
        self.wallet.address()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> ClaimResult<Signature> {
        self.wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| ClaimError::TransactionRejected(e.to_string()))
    }
}

/// Denies every signature request, like a user dismissing the wallet
/// prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefusingSigner;

#[async_trait]
impl ClaimSigner for RefusingSigner {
    fn address(&self) -> EthAddress {
        EthAddress::repeat_byte(0x66)
    }

    async fn sign_transaction(&self, _tx: &TypedTransaction) -> ClaimResult<Signature> {
        Err(ClaimError::TransactionRejected(
            "User denied transaction signature.".to_string(),
        ))
    }
}

/// Scriptable [`MembershipOracle`] that records how often it is consulted.
pub struct StubMembership {
    grant: bool,
    probes: AtomicUsize,
}

impl StubMembership {
    pub fn granting() -> Self {
        Self {
            grant: true,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: false,
            probes: AtomicUsize::new(0),
        }
    }

    /// Oracle consultations so far, across all three checks.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    fn consult(&self) -> ClaimResult<bool> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        Ok(self.grant)
    }
}

#[async_trait]
impl MembershipOracle for StubMembership {
    async fn is_whitelisted(
        &self,
        _template_id: TemplateId,
        _user: EthAddress,
    ) -> ClaimResult<bool> {
        self.consult()
    }

    async fn holds_required_token(
        &self,
        _template_id: TemplateId,
        _user: EthAddress,
    ) -> ClaimResult<bool> {
        self.consult()
    }

    async fn has_profile(&self, _user: EthAddress) -> ClaimResult<bool> {
        self.consult()
    }
}
