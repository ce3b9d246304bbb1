// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Raw `CardClaimed` log handling. The registry contract emits
//! `CardClaimed(uint256 indexed templateId, address indexed claimer,
//! uint256 cardId, uint256 timestamp)` for every successful claim; this
//! module turns provider logs and receipts into [`ClaimEvent`]s.

use ethers::abi::{self, long_signature, ParamType};
use ethers::types::{Address as EthAddress, Log, TransactionReceipt, TxHash, H256, U256};
use once_cell::sync::Lazy;

use crate::error::{ClaimError, ClaimResult};
use crate::types::TemplateId;

/// topic0 of `CardClaimed(uint256,address,uint256,uint256)`.
pub static CARD_CLAIMED_TOPIC: Lazy<H256> = Lazy::new(|| {
    long_signature(
        "CardClaimed",
        &[
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
        ],
    )
});

/// A decoded `CardClaimed` emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEvent {
    pub template_id: TemplateId,
    pub claimer: EthAddress,
    /// Id of the card minted by the claim.
    pub card_id: u64,
    /// Chain timestamp carried in the event data, unix seconds.
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: TxHash,
}

pub fn decode_claim_log(log: &Log) -> ClaimResult<ClaimEvent> {
    if log.topics.len() != 3 {
        return Err(ClaimError::Decode(format!(
            "expected 3 topics in claim log, got {}",
            log.topics.len()
        )));
    }
    if log.topics[0] != *CARD_CLAIMED_TOPIC {
        return Err(ClaimError::Decode(format!(
            "unexpected event signature {:?}",
            log.topics[0]
        )));
    }
    let template_id = u64_from_topic(&log.topics[1], "templateId")?;
    let claimer = EthAddress::from(log.topics[2]);

    let tokens = abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], &log.data)
        .map_err(|e| ClaimError::Decode(format!("claim log data: {e}")))?;
    let card_id = u64_from_token(&tokens[0], "cardId")?;
    let timestamp = u64_from_token(&tokens[1], "timestamp")?;

    let block_number = log
        .block_number
        .ok_or_else(|| ClaimError::Decode("claim log without block number".to_string()))?
        .as_u64();
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| ClaimError::Decode("claim log without tx hash".to_string()))?;

    Ok(ClaimEvent {
        template_id,
        claimer,
        card_id,
        timestamp,
        block_number,
        tx_hash,
    })
}

/// Finds and decodes the `CardClaimed` emission in a confirmed receipt.
/// A receipt with status 0 or without the event is a failed claim.
pub fn extract_claim_event(
    receipt: &TransactionReceipt,
    registry: EthAddress,
) -> ClaimResult<ClaimEvent> {
    if receipt.status == Some(0.into()) {
        return Err(ClaimError::TransactionFailed(format!(
            "claim transaction {:?} reverted",
            receipt.transaction_hash
        )));
    }
    for log in &receipt.logs {
        if log.address == registry && log.topics.first() == Some(&*CARD_CLAIMED_TOPIC) {
            let mut log = log.clone();
            // Receipt logs occasionally omit per-log positions; backfill
            // from the receipt itself.
            if log.block_number.is_none() {
                log.block_number = receipt.block_number;
            }
            if log.transaction_hash.is_none() {
                log.transaction_hash = Some(receipt.transaction_hash);
            }
            return decode_claim_log(&log);
        }
    }
    Err(ClaimError::TransactionFailed(format!(
        "claim transaction {:?} confirmed without a CardClaimed event",
        receipt.transaction_hash
    )))
}

fn u64_from_topic(topic: &H256, field: &str) -> ClaimResult<u64> {
    let value = U256::from_big_endian(topic.as_bytes());
    if value.bits() > 64 {
        return Err(ClaimError::Decode(format!("{field} out of u64 range")));
    }
    Ok(value.low_u64())
}

pub(crate) fn u64_from_token(token: &abi::Token, field: &str) -> ClaimResult<u64> {
    match token {
        abi::Token::Uint(value) if value.bits() <= 64 => Ok(value.low_u64()),
        abi::Token::Uint(_) => Err(ClaimError::Decode(format!("{field} out of u64 range"))),
        other => Err(ClaimError::Decode(format!(
            "{field}: unexpected token {other:?}"
        ))),
    }
}
