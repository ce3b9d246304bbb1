// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Bytes, Filter, Signature, TransactionReceipt, TransactionRequest,
    TxHash, U256,
};
use ethers::utils::id;
use tap::TapFallible;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{ClaimError, ClaimResult};
use crate::events::{decode_claim_log, u64_from_token, ClaimEvent, CARD_CLAIMED_TOPIC};
use crate::metered_provider::{new_metered_claim_provider, MeteredClaimHttpProvider};
use crate::metrics::ClaimMetrics;
use crate::types::{EligibilityType, RarityTier, Template, TemplateId};

#[cfg(test)]
use crate::mock_provider::MockClaimProvider;

/// Wallet collaborator. The engine never holds signing material; it hands
/// the prepared transaction to the signer for the duration of one
/// submission.
#[async_trait]
pub trait ClaimSigner: Send + Sync {
    /// The address claims are submitted from.
    fn address(&self) -> EthAddress;

    /// Signs the prepared claim transaction. A wallet refusal must surface
    /// as `ClaimError::TransactionRejected` carrying the wallet's message
    /// verbatim.
    async fn sign_transaction(&self, tx: &TypedTransaction) -> ClaimResult<Signature>;
}

/// Read/write accessor over the collectible template registry contract.
pub struct ChainReader<P> {
    provider: Provider<P>,
    registry_address: EthAddress,
    /// Expected chain ID for validation
    expected_chain_id: Option<u64>,
}

impl ChainReader<MeteredClaimHttpProvider> {
    pub async fn new(
        provider_url: &str,
        registry_address: EthAddress,
        expected_chain_id: Option<u64>,
        metrics: Arc<ClaimMetrics>,
    ) -> anyhow::Result<Self> {
        let provider = new_metered_claim_provider(provider_url, metrics)?;
        let self_ = Self {
            provider,
            registry_address,
            expected_chain_id,
        };
        self_.describe().await?;
        Ok(self_)
    }
}

#[cfg(test)]
impl ChainReader<MockClaimProvider> {
    pub fn new_mocked(provider: MockClaimProvider, registry_address: EthAddress) -> Self {
        Self {
            provider: Provider::new(provider),
            registry_address,
            expected_chain_id: None,
        }
    }
}

impl<P> ChainReader<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn registry_address(&self) -> EthAddress {
        self.registry_address
    }

    pub async fn get_chain_id(&self) -> ClaimResult<u64> {
        let chain_id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| ClaimError::Rpc(format!("chain id query failed: {e}")))?;
        Ok(chain_id.as_u64())
    }

    // Validate chain identifier and log connection info
    pub(crate) async fn describe(&self) -> anyhow::Result<()> {
        let chain_id = self.get_chain_id().await?;
        let block_number = self.latest_block().await?;

        if let Some(expected) = self.expected_chain_id {
            if chain_id != expected {
                return Err(anyhow::anyhow!(
                    "Chain ID mismatch: expected {}, got {}. This could indicate connecting to the wrong network!",
                    expected,
                    chain_id
                ));
            }
            tracing::info!(
                "ChainReader connected to chain {} (verified), registry {:?}, current block: {}",
                chain_id,
                self.registry_address,
                block_number
            );
        } else {
            tracing::warn!(
                "ChainReader connected to chain {} (NOT VERIFIED - no expected chain ID set), registry {:?}, current block: {}",
                chain_id,
                self.registry_address,
                block_number
            );
        }
        Ok(())
    }

    pub async fn latest_block(&self) -> ClaimResult<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ClaimError::Rpc(format!("block number query failed: {e}")))?;
        Ok(block.as_u64())
    }

    /// Fetches one template. An issuer equal to the zero address is the
    /// registry's not-found sentinel and maps to `ClaimError::NotFound`,
    /// which sequential probing uses as its termination signal.
    pub async fn get_template(&self, template_id: TemplateId) -> ClaimResult<Template> {
        let raw = self.registry_call(get_template_calldata(template_id)).await?;
        decode_template(template_id, &raw)
    }

    pub async fn get_all_template_ids(&self) -> ClaimResult<Vec<TemplateId>> {
        let raw = self.registry_call(get_all_template_ids_calldata()).await?;
        let tokens = abi::decode(&[ParamType::Array(Box::new(ParamType::Uint(256)))], &raw)
            .map_err(|e| ClaimError::Decode(format!("template id list: {e}")))?;
        match tokens.into_iter().next() {
            Some(Token::Array(items)) => items
                .iter()
                .map(|item| u64_from_token(item, "templateId"))
                .collect(),
            other => Err(ClaimError::Decode(format!(
                "template id list: unexpected token {other:?}"
            ))),
        }
    }

    pub async fn has_claimed(&self, template_id: TemplateId, user: EthAddress) -> ClaimResult<bool> {
        let raw = self
            .registry_call(has_claimed_calldata(template_id, user))
            .await?;
        let tokens = abi::decode(&[ParamType::Bool], &raw)
            .map_err(|e| ClaimError::Decode(format!("hasClaimed return: {e}")))?;
        match tokens.into_iter().next() {
            Some(Token::Bool(flag)) => Ok(flag),
            other => Err(ClaimError::Decode(format!(
                "hasClaimed return: unexpected token {other:?}"
            ))),
        }
    }

    // Note: query may fail if range is too big. Callsite is responsible
    // for chunking the query.
    pub async fn get_claim_events_in_range(
        &self,
        user: Option<EthAddress>,
        start_block: u64,
        end_block: u64,
    ) -> ClaimResult<Vec<ClaimEvent>> {
        let filter = claim_event_filter(self.registry_address, user, start_block, end_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ClaimError::Rpc(format!("log query failed: {e}")))
            .tap_err(|e| {
                tracing::error!(
                    "get_claim_events_in_range failed. Filter: {:?}. Error {:?}",
                    filter,
                    e
                )
            })?;

        // Safeguard check that all events are emitted from the registry
        if logs.iter().any(|log| log.address != self.registry_address) {
            return Err(ClaimError::Rpc(format!(
                "Provider returned logs from a different contract address (expected: {:?})",
                self.registry_address
            )));
        }

        logs.iter().map(decode_claim_log).collect()
    }

    /// Runs `eth_estimateGas` for a claim, bounded by a caller-supplied
    /// timeout. A timed-out estimate maps to `ClaimError::Rpc`.
    pub async fn estimate_claim_gas(
        &self,
        template_id: TemplateId,
        from: EthAddress,
        timeout: Duration,
    ) -> ClaimResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(self.registry_address)
            .data(claim_card_calldata(template_id))
            .into();
        match tokio::time::timeout(timeout, self.provider.estimate_gas(&tx, None)).await {
            Ok(Ok(gas)) => Ok(gas),
            Ok(Err(e)) => Err(ClaimError::Rpc(format!("gas estimate failed: {e}"))),
            Err(_) => Err(ClaimError::Rpc(format!(
                "gas estimate timed out after {timeout:?}"
            ))),
        }
    }

    /// Prepares, signs and broadcasts one claim transaction. Nonce, gas
    /// price and chain id are filled from the provider; the signature comes
    /// from the injected signer. Never retried here - a repeat claim is a
    /// new user action.
    pub async fn submit_claim(
        &self,
        template_id: TemplateId,
        signer: &dyn ClaimSigner,
    ) -> ClaimResult<TxHash> {
        let from = signer.address();
        let nonce = self
            .provider
            .get_transaction_count(from, None)
            .await
            .map_err(|e| ClaimError::Rpc(format!("nonce query failed: {e}")))?;
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| ClaimError::Rpc(format!("gas price query failed: {e}")))?;
        let chain_id = self.get_chain_id().await?;

        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(self.registry_address)
            .data(claim_card_calldata(template_id))
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(chain_id)
            .into();
        let gas = self
            .provider
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| ClaimError::Rpc(format!("gas estimate failed: {e}")))?;
        tx.set_gas(gas);

        let signature = signer.sign_transaction(&tx).await?;
        let raw = tx.rlp_signed(&signature);
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ClaimError::Rpc(format!("broadcast failed: {e}")))?;
        let tx_hash = pending.tx_hash();
        tracing::info!(
            "Submitted claim for template {} from {:?}: {:?}",
            template_id,
            from,
            tx_hash
        );
        Ok(tx_hash)
    }

    /// Polls for the receipt of a submitted claim. There is no overall
    /// deadline - confirmation can legitimately take minutes - but the
    /// watch is cancellable; cancellation returns `None` and never
    /// un-submits the transaction. Transient poll failures keep polling.
    pub async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> ClaimResult<Option<TransactionReceipt>> {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stopped watching claim transaction {:?} before a receipt was observed", tx_hash);
                    return Ok(None);
                }
                _ = interval.tick() => {
                    let receipt = match self.provider.get_transaction_receipt(tx_hash).await {
                        Ok(receipt) => receipt,
                        Err(e) => {
                            tracing::warn!("Receipt poll for {:?} failed, will retry: {e}", tx_hash);
                            continue;
                        }
                    };
                    if let Some(receipt) = receipt {
                        if receipt.status == Some(0.into()) {
                            return Err(ClaimError::TransactionFailed(format!(
                                "claim transaction {tx_hash:?} reverted"
                            )));
                        }
                        return Ok(Some(receipt));
                    }
                }
            }
        }
    }

    async fn registry_call(&self, data: Bytes) -> ClaimResult<Vec<u8>> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.registry_address)
            .data(data)
            .into();
        let raw = self
            .provider
            .call(&tx, None)
            .await
            .map_err(|e| ClaimError::Rpc(format!("registry call failed: {e}")))?;
        Ok(raw.to_vec())
    }
}

pub(crate) fn get_template_calldata(template_id: TemplateId) -> Bytes {
    encode_call("getTemplate(uint256)", &[Token::Uint(U256::from(template_id))])
}

pub(crate) fn get_all_template_ids_calldata() -> Bytes {
    encode_call("getAllTemplateIds()", &[])
}

pub(crate) fn has_claimed_calldata(template_id: TemplateId, user: EthAddress) -> Bytes {
    encode_call(
        "hasClaimed(uint256,address)",
        &[Token::Uint(U256::from(template_id)), Token::Address(user)],
    )
}

pub(crate) fn claim_card_calldata(template_id: TemplateId) -> Bytes {
    encode_call("claimCard(uint256)", &[Token::Uint(U256::from(template_id))])
}

fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

/// The log filter used for claim-history queries. Shared so tests can
/// reproduce the exact request payload.
pub(crate) fn claim_event_filter(
    registry: EthAddress,
    user: Option<EthAddress>,
    start_block: u64,
    end_block: u64,
) -> Filter {
    let filter = Filter::new()
        .from_block(start_block)
        .to_block(end_block)
        .address(registry)
        .topic0(*CARD_CLAIMED_TOPIC);
    match user {
        Some(user) => filter.topic2(user),
        None => filter,
    }
}

/// `getTemplate` returns the template attributes as flat values, in
/// declaration order, without the id.
fn template_return_types() -> [ParamType; 12] {
    [
        ParamType::Address,   // issuer
        ParamType::String,    // category
        ParamType::String,    // description
        ParamType::Uint(8),   // rarityTier
        ParamType::Uint(256), // maxSupply
        ParamType::Uint(256), // currentSupply
        ParamType::Uint(8),   // tier
        ParamType::Uint(256), // startTime
        ParamType::Uint(256), // endTime
        ParamType::Bool,      // isPaused
        ParamType::Uint(8),   // eligibilityType
        ParamType::String,    // metadataURI
    ]
}

fn decode_template(template_id: TemplateId, raw: &[u8]) -> ClaimResult<Template> {
    if raw.is_empty() {
        return Err(ClaimError::Decode(
            "empty return data from registry".to_string(),
        ));
    }
    let tokens = abi::decode(&template_return_types(), raw)
        .map_err(|e| ClaimError::Decode(format!("template {template_id}: {e}")))?;
    let mut tokens = tokens.into_iter();
    let mut next = || {
        tokens
            .next()
            .ok_or_else(|| ClaimError::Decode(format!("template {template_id}: truncated tuple")))
    };

    let issuer = address_from_token(&next()?, "issuer")?;
    if issuer == EthAddress::zero() {
        return Err(ClaimError::NotFound);
    }
    let category = string_from_token(&next()?, "category")?;
    let description = string_from_token(&next()?, "description")?;
    let rarity_raw = u8_from_token(&next()?, "rarityTier")?;
    let rarity = RarityTier::try_from(rarity_raw)
        .map_err(|_| ClaimError::Decode(format!("unknown rarity tier {rarity_raw}")))?;
    let max_supply = u64_from_token(&next()?, "maxSupply")?;
    let current_supply = u64_from_token(&next()?, "currentSupply")?;
    let tier = u8_from_token(&next()?, "tier")?;
    let start_time = u64_from_token(&next()?, "startTime")?;
    let end_time = u64_from_token(&next()?, "endTime")?;
    let is_paused = bool_from_token(&next()?, "isPaused")?;
    let eligibility_raw = u8_from_token(&next()?, "eligibilityType")?;
    let eligibility = EligibilityType::try_from(eligibility_raw)
        .map_err(|_| ClaimError::Decode(format!("unknown eligibility type {eligibility_raw}")))?;
    let metadata_uri = string_from_token(&next()?, "metadataURI")?;

    Ok(Template {
        template_id,
        issuer,
        category,
        description,
        rarity,
        max_supply,
        current_supply,
        tier,
        start_time,
        end_time,
        is_paused,
        eligibility,
        metadata_uri,
    })
}

fn address_from_token(token: &Token, field: &str) -> ClaimResult<EthAddress> {
    match token {
        Token::Address(address) => Ok(*address),
        other => Err(ClaimError::Decode(format!(
            "{field}: unexpected token {other:?}"
        ))),
    }
}

fn string_from_token(token: &Token, field: &str) -> ClaimResult<String> {
    match token {
        Token::String(value) => Ok(value.clone()),
        other => Err(ClaimError::Decode(format!(
            "{field}: unexpected token {other:?}"
        ))),
    }
}

fn bool_from_token(token: &Token, field: &str) -> ClaimResult<bool> {
    match token {
        Token::Bool(value) => Ok(*value),
        other => Err(ClaimError::Decode(format!(
            "{field}: unexpected token {other:?}"
        ))),
    }
}

fn u8_from_token(token: &Token, field: &str) -> ClaimResult<u8> {
    let value = u64_from_token(token, field)?;
    u8::try_from(value).map_err(|_| ClaimError::Decode(format!("{field} out of u8 range")))
}
