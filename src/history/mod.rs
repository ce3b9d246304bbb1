// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Claim history: the durable record of confirmed claims and the
//! synchronizer that keeps it aligned with the chain.

pub mod store;
pub mod synchronizer;

pub use store::{ClaimQuery, ClaimStore, MemoryClaimStore};
pub use synchronizer::{ClaimSubscription, HistorySynchronizer, SyncOutcome};
