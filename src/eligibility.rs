// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Claim eligibility evaluation. The rules run in a fixed order and the
//! first failure wins, so callers always see the same reason for the same
//! chain state.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::JsonRpcClient;
use ethers::types::Address as EthAddress;

use crate::chain_reader::ChainReader;
use crate::error::ClaimResult;
use crate::types::{unix_now, ClaimStatus, EligibilityType, Template, TemplateId};

/// Identity-based membership checks backing the `Whitelist`, `TokenHolder`
/// and `ProfileRequired` eligibility types. The engine only consults the
/// oracle once every state gate (pause, schedule, supply) has passed.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn is_whitelisted(&self, template_id: TemplateId, user: EthAddress)
        -> ClaimResult<bool>;
    async fn holds_required_token(
        &self,
        template_id: TemplateId,
        user: EthAddress,
    ) -> ClaimResult<bool>;
    async fn has_profile(&self, user: EthAddress) -> ClaimResult<bool>;
}

/// Oracle that grants every membership check. Suitable when the registry
/// only issues `Open` templates.
pub struct AllowAllMembership;

#[async_trait]
impl MembershipOracle for AllowAllMembership {
    async fn is_whitelisted(
        &self,
        _template_id: TemplateId,
        _user: EthAddress,
    ) -> ClaimResult<bool> {
        Ok(true)
    }

    async fn holds_required_token(
        &self,
        _template_id: TemplateId,
        _user: EthAddress,
    ) -> ClaimResult<bool> {
        Ok(true)
    }

    async fn has_profile(&self, _user: EthAddress) -> ClaimResult<bool> {
        Ok(true)
    }
}

pub struct EligibilityEvaluator<P> {
    reader: Arc<ChainReader<P>>,
    oracle: Arc<dyn MembershipOracle>,
}

impl<P> EligibilityEvaluator<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(reader: Arc<ChainReader<P>>, oracle: Arc<dyn MembershipOracle>) -> Self {
        Self { reader, oracle }
    }

    /// Evaluates whether `user` can claim `template` right now.
    pub async fn check(&self, template: &Template, user: EthAddress) -> ClaimResult<ClaimStatus> {
        self.check_at(template, user, unix_now()).await
    }

    pub(crate) async fn check_at(
        &self,
        template: &Template,
        user: EthAddress,
        now: u64,
    ) -> ClaimResult<ClaimStatus> {
        let has_claimed = self
            .reader
            .has_claimed(template.template_id, user)
            .await?;
        // The oracle may be a remote service; skip it whenever an earlier
        // rule already decides the outcome.
        let membership_ok = if has_claimed || gated_before_membership(template, now) {
            true
        } else {
            self.probe_membership(template, user).await?
        };
        Ok(evaluate_rules(template, has_claimed, membership_ok, now))
    }

    async fn probe_membership(&self, template: &Template, user: EthAddress) -> ClaimResult<bool> {
        match template.eligibility {
            EligibilityType::Open => Ok(true),
            EligibilityType::Whitelist => {
                self.oracle.is_whitelisted(template.template_id, user).await
            }
            EligibilityType::TokenHolder => {
                self.oracle
                    .holds_required_token(template.template_id, user)
                    .await
            }
            EligibilityType::ProfileRequired => self.oracle.has_profile(user).await,
        }
    }
}

/// State gates evaluated ahead of the membership rule.
fn gated_before_membership(template: &Template, now: u64) -> bool {
    template.is_paused
        || !template.has_started(now)
        || template.has_ended(now)
        || template.is_sold_out()
}

/// The fixed rule ladder. `is_eligible` reflects the identity gate alone:
/// a paused or sold-out template leaves it true, and a past claim proves
/// the user was eligible. `can_claim_now` is only true when every rule
/// passes.
pub(crate) fn evaluate_rules(
    template: &Template,
    has_claimed: bool,
    membership_ok: bool,
    now: u64,
) -> ClaimStatus {
    let blocked = |reason: &str, is_eligible: bool| ClaimStatus {
        has_claimed,
        is_eligible,
        can_claim_now: false,
        reason: Some(reason.to_string()),
    };

    if has_claimed {
        return blocked("Already claimed", true);
    }
    if template.is_paused {
        return blocked("Paused", membership_ok);
    }
    if !template.has_started(now) {
        return blocked("Not started", membership_ok);
    }
    if template.has_ended(now) {
        return blocked("Expired", membership_ok);
    }
    if template.is_sold_out() {
        return blocked("Sold out", membership_ok);
    }
    if !membership_ok {
        return blocked(membership_reason(template.eligibility), false);
    }
    ClaimStatus {
        has_claimed: false,
        is_eligible: true,
        can_claim_now: true,
        reason: None,
    }
}

fn membership_reason(eligibility: EligibilityType) -> &'static str {
    match eligibility {
        EligibilityType::Open => "Not eligible",
        EligibilityType::Whitelist => "Not whitelisted",
        EligibilityType::TokenHolder => "Required token not held",
        EligibilityType::ProfileRequired => "Profile required",
    }
}
