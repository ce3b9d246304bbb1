// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the claim engine. Every fallible operation returns
//! `ClaimResult<T>`; `error_type()` provides the stable labels used by
//! metrics and alerting.

use ethers::providers::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    /// The requested template id has never been created on-chain.
    #[error("Template not found")]
    NotFound,
    /// Transport or node failure. Safe to retry.
    #[error("RPC error: {0}")]
    Rpc(String),
    /// The signer or wallet refused before broadcast. The message is kept
    /// verbatim so the caller can surface it as-is.
    #[error("{0}")]
    TransactionRejected(String),
    /// The transaction landed on-chain and reverted, or confirmed without
    /// the expected claim event.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
    /// Business outcome of eligibility evaluation, not a transport fault.
    #[error("Not eligible: {reason}")]
    Ineligible { reason: String },
    /// A claim for the same (user, template) pair is still in flight.
    #[error("Claim already in flight for template {template_id}")]
    ClaimInFlight { template_id: u64 },
    /// The history listener missed a poll window. Entries may lag until
    /// catch-up completes.
    #[error("Listener gap after block {last_confirmed}")]
    ListenerGap { last_confirmed: u64 },
    /// On-chain data did not decode into the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),
    /// The injected claim store failed.
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ClaimResult<T> = Result<T, ClaimError>;

impl ClaimError {
    /// Returns a short text representation used as a metric label.
    /// These labels feed dashboards and alerts - they MUST remain stable.
    pub fn error_type(&self) -> &'static str {
        match self {
            ClaimError::NotFound => "not_found",
            ClaimError::Rpc(_) => "rpc_error",
            ClaimError::TransactionRejected(_) => "transaction_rejected",
            ClaimError::TransactionFailed(_) => "transaction_failed",
            ClaimError::Ineligible { .. } => "ineligible_claim",
            ClaimError::ClaimInFlight { .. } => "claim_in_flight",
            ClaimError::ListenerGap { .. } => "listener_gap",
            ClaimError::Decode(_) => "decode_error",
            ClaimError::Storage(_) => "storage_error",
            ClaimError::InvalidConfig(_) => "invalid_config",
            ClaimError::Internal(_) => "internal_error",
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClaimError::Rpc(_) | ClaimError::ListenerGap { .. } | ClaimError::Storage(_)
        )
    }
}

impl From<ProviderError> for ClaimError {
    fn from(err: ProviderError) -> Self {
        ClaimError::Rpc(err.to_string())
    }
}
