// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The engine facade. Owns the chain reader, registry cache, eligibility
//! evaluator, history synchronizer and trending service, and hands out
//! per-user claim controllers wired into the shared state.

use std::sync::Arc;

use anyhow::Context;
use ethers::providers::JsonRpcClient;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::chain_reader::{ChainReader, ClaimSigner};
use crate::config::EngineConfig;
use crate::controller::{ClaimController, InFlightClaims};
use crate::eligibility::{EligibilityEvaluator, MembershipOracle};
use crate::error::ClaimResult;
use crate::history::{
    ClaimQuery, ClaimStore, ClaimSubscription, HistorySynchronizer, SyncOutcome,
};
use crate::metered_provider::MeteredClaimHttpProvider;
use crate::metrics::ClaimMetrics;
use crate::registry::TemplateRegistry;
use crate::trending::TrendingService;
use crate::types::{
    unix_now, ClaimHistoryEntry, ClaimStats, ClaimStatus, Template, TemplateId, TrendingScore,
};

/// The three ranking views, composed from one registry snapshot and one
/// pass over recent claim counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingLists {
    pub trending: Vec<Template>,
    pub expiring_soon: Vec<Template>,
    pub low_supply: Vec<Template>,
}

pub struct ClaimEngine<P> {
    config: EngineConfig,
    reader: Arc<ChainReader<P>>,
    registry: Arc<TemplateRegistry<P>>,
    evaluator: Arc<EligibilityEvaluator<P>>,
    history: Arc<HistorySynchronizer<P>>,
    trending: TrendingService,
    metrics: Arc<ClaimMetrics>,
    in_flight: InFlightClaims,
    cancel: CancellationToken,
}

impl ClaimEngine<MeteredClaimHttpProvider> {
    /// Connects to the configured node, validates the chain id and wires
    /// up the full engine. Fails fast on configuration or connection
    /// problems instead of limping along against the wrong network.
    pub async fn new(
        config: EngineConfig,
        oracle: Arc<dyn MembershipOracle>,
        store: Arc<dyn ClaimStore>,
        metrics_registry: &prometheus::Registry,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .context("invalid engine configuration")?;
        let metrics = Arc::new(ClaimMetrics::new(metrics_registry));
        let registry_address = config.registry_address()?;
        let reader = Arc::new(
            ChainReader::new(
                &config.rpc_url,
                registry_address,
                config.expected_chain_id,
                metrics.clone(),
            )
            .await?,
        );
        Ok(Self::assemble(config, reader, oracle, store, metrics))
    }
}

#[cfg(test)]
impl ClaimEngine<crate::mock_provider::MockClaimProvider> {
    pub(crate) fn new_mocked(
        provider: crate::mock_provider::MockClaimProvider,
        config: EngineConfig,
        oracle: Arc<dyn MembershipOracle>,
        store: Arc<dyn ClaimStore>,
    ) -> Self {
        let metrics = Arc::new(ClaimMetrics::new_for_testing());
        let registry_address = config.registry_address().expect("valid registry address");
        let reader = Arc::new(ChainReader::new_mocked(provider, registry_address));
        Self::assemble(config, reader, oracle, store, metrics)
    }
}

impl<P> ClaimEngine<P>
where
    P: JsonRpcClient + 'static,
{
    fn assemble(
        config: EngineConfig,
        reader: Arc<ChainReader<P>>,
        oracle: Arc<dyn MembershipOracle>,
        store: Arc<dyn ClaimStore>,
        metrics: Arc<ClaimMetrics>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let registry = Arc::new(TemplateRegistry::new(
            reader.clone(),
            config.registry.clone(),
            metrics.clone(),
        ));
        let evaluator = Arc::new(EligibilityEvaluator::new(reader.clone(), oracle));
        let history = Arc::new(HistorySynchronizer::new(
            reader.clone(),
            registry.clone(),
            store,
            config.listener.clone(),
            metrics.clone(),
            cancel.child_token(),
        ));
        let trending = TrendingService::new(config.trending.clone());
        Self {
            config,
            reader,
            registry,
            evaluator,
            history,
            trending,
            metrics,
            in_flight: InFlightClaims::default(),
            cancel,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The cached template set; `force_refresh` bypasses the TTL.
    pub async fn templates(&self, force_refresh: bool) -> ClaimResult<Arc<Vec<Template>>> {
        self.registry.get_all(force_refresh).await
    }

    pub async fn template(&self, template_id: TemplateId) -> ClaimResult<Template> {
        self.registry.get_by_id(template_id).await
    }

    pub async fn check_eligibility(
        &self,
        template_id: TemplateId,
        user: EthAddress,
    ) -> ClaimResult<ClaimStatus> {
        let template = self.registry.get_by_id(template_id).await?;
        self.evaluator.check(&template, user).await
    }

    /// A claim state machine for `signer`, sharing the engine-wide
    /// in-flight set so duplicate claims are rejected across controllers.
    pub fn controller_for<S>(&self, signer: Arc<S>) -> ClaimController<P, S>
    where
        S: ClaimSigner,
    {
        ClaimController::new(
            self.reader.clone(),
            self.registry.clone(),
            self.evaluator.clone(),
            Some(self.history.clone()),
            signer,
            self.config.claim.clone(),
            self.metrics.clone(),
            self.in_flight.clone(),
            self.cancel.child_token(),
        )
    }

    pub async fn claim_history(&self, query: &ClaimQuery) -> ClaimResult<Vec<ClaimHistoryEntry>> {
        self.history.claims(query).await
    }

    pub async fn claim_stats(&self, user: EthAddress) -> ClaimResult<ClaimStats> {
        self.history.claim_stats(user).await
    }

    /// One synchronization pass for `user`; see [`HistorySynchronizer::sync`].
    pub async fn sync_history(
        &self,
        user: EthAddress,
        from_block: Option<u64>,
    ) -> ClaimResult<SyncOutcome> {
        self.history.sync(user, from_block).await
    }

    /// Starts tailing new claims for `user` in the background.
    pub async fn listen(&self, user: EthAddress) -> ClaimResult<ClaimSubscription> {
        self.history.listen(user).await
    }

    /// Every claim ingested from now on, across users and sources.
    pub fn subscribe_claims(&self) -> broadcast::Receiver<ClaimHistoryEntry> {
        self.history.subscribe_events()
    }

    pub async fn trending_snapshot(&self, limit: usize) -> ClaimResult<TrendingLists> {
        let templates = self.registry.get_all(false).await?;
        let now = unix_now();
        let since = now.saturating_sub(self.config.trending.window.as_secs());
        let counts = self.history.recent_claim_counts(since).await?;
        Ok(TrendingLists {
            trending: self.trending.trending(&templates, &counts, limit),
            expiring_soon: self.trending.expiring_soon(&templates, now, limit),
            low_supply: self.trending.low_supply(&templates, limit),
        })
    }

    pub async fn template_score(&self, template_id: TemplateId) -> ClaimResult<TrendingScore> {
        let template = self.registry.get_by_id(template_id).await?;
        let now = unix_now();
        let since = now.saturating_sub(self.config.trending.window.as_secs());
        let counts = self.history.recent_claim_counts(since).await?;
        let count = counts.get(&template_id).copied().unwrap_or(0);
        Ok(self.trending.score(&template, count, now))
    }

    /// Cancels background listeners and in-flight confirmation watches.
    /// Submitted transactions are not affected.
    pub fn shutdown(&self) {
        tracing::info!("Claim engine shutting down");
        self.cancel.cancel();
    }
}
