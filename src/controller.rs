// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The claim transaction state machine. One controller per signing user;
//! phase changes are published over a watch channel so UIs can follow a
//! claim from submission to confirmation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ethers::providers::JsonRpcClient;
use ethers::types::{Address as EthAddress, TxHash, U256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::chain_reader::{ChainReader, ClaimSigner};
use crate::config::ClaimConfig;
use crate::eligibility::EligibilityEvaluator;
use crate::error::{ClaimError, ClaimResult};
use crate::events::{extract_claim_event, ClaimEvent};
use crate::history::HistorySynchronizer;
use crate::metrics::ClaimMetrics;
use crate::registry::TemplateRegistry;
use crate::types::TemplateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimPhase {
    #[default]
    Idle,
    Estimating,
    Claiming,
    Success,
    Error,
}

/// Snapshot of the state machine, published on every transition.
#[derive(Debug, Clone, Default)]
pub struct ClaimState {
    pub phase: ClaimPhase,
    pub template_id: Option<TemplateId>,
    pub tx_hash: Option<TxHash>,
    pub card_id: Option<u64>,
    pub error: Option<String>,
}

/// Claims currently in flight across all controllers of one engine, keyed
/// by (user, template). A second claim for the same key is rejected before
/// any chain traffic happens.
#[derive(Clone, Default)]
pub(crate) struct InFlightClaims {
    keys: Arc<Mutex<HashSet<(EthAddress, TemplateId)>>>,
}

impl InFlightClaims {
    fn try_acquire(&self, user: EthAddress, template_id: TemplateId) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap();
        if !keys.insert((user, template_id)) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key: (user, template_id),
        })
    }
}

struct InFlightGuard {
    keys: Arc<Mutex<HashSet<(EthAddress, TemplateId)>>>,
    key: (EthAddress, TemplateId),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.lock().unwrap().remove(&self.key);
    }
}

pub struct ClaimController<P, S> {
    reader: Arc<ChainReader<P>>,
    registry: Arc<TemplateRegistry<P>>,
    evaluator: Arc<EligibilityEvaluator<P>>,
    history: Option<Arc<HistorySynchronizer<P>>>,
    signer: Arc<S>,
    user: EthAddress,
    config: ClaimConfig,
    metrics: Arc<ClaimMetrics>,
    in_flight: InFlightClaims,
    state: watch::Sender<ClaimState>,
    cancel: CancellationToken,
}

impl<P, S> ClaimController<P, S>
where
    P: JsonRpcClient + 'static,
    S: ClaimSigner,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        reader: Arc<ChainReader<P>>,
        registry: Arc<TemplateRegistry<P>>,
        evaluator: Arc<EligibilityEvaluator<P>>,
        history: Option<Arc<HistorySynchronizer<P>>>,
        signer: Arc<S>,
        config: ClaimConfig,
        metrics: Arc<ClaimMetrics>,
        in_flight: InFlightClaims,
        cancel: CancellationToken,
    ) -> Self {
        let user = signer.address();
        let (state, _) = watch::channel(ClaimState::default());
        Self {
            reader,
            registry,
            evaluator,
            history,
            signer,
            user,
            config,
            metrics,
            in_flight,
            state,
            cancel,
        }
    }

    pub fn user(&self) -> EthAddress {
        self.user
    }

    /// Current state snapshot.
    pub fn state(&self) -> ClaimState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every phase transition.
    pub fn subscribe(&self) -> watch::Receiver<ClaimState> {
        self.state.subscribe()
    }

    /// Advisory gas estimate for claiming `template_id`. Holds the
    /// `Estimating` phase for the duration; on success the prior phase is
    /// restored, on failure the controller lands in `Error` with the cause
    /// recorded. Neither outcome blocks a later claim.
    pub async fn estimate_gas(&self, template_id: TemplateId) -> ClaimResult<U256> {
        let mut permitted = Ok(ClaimPhase::Idle);
        self.state.send_modify(|state| match state.phase {
            ClaimPhase::Idle | ClaimPhase::Success | ClaimPhase::Error => {
                permitted = Ok(state.phase);
                state.phase = ClaimPhase::Estimating;
            }
            ClaimPhase::Estimating => {
                permitted = Err(ClaimError::Internal("gas estimate in progress".to_string()));
            }
            ClaimPhase::Claiming => {
                permitted = Err(ClaimError::ClaimInFlight { template_id });
            }
        });
        let prior = permitted?;

        let timer = self
            .metrics
            .claim_latency
            .with_label_values(&["estimate"])
            .start_timer();
        let result = self
            .reader
            .estimate_claim_gas(template_id, self.user, self.config.estimate_timeout)
            .await;
        timer.observe_duration();

        match &result {
            Ok(_) => self.state.send_modify(|state| state.phase = prior),
            Err(e) => {
                let cause = e.to_string();
                self.state.send_modify(|state| {
                    state.phase = ClaimPhase::Error;
                    state.error = Some(cause);
                });
            }
        }
        result
    }

    /// Drives one claim end to end: re-validate eligibility, submit the
    /// signed transaction, await its receipt and decode the emitted
    /// `CardClaimed` event. The cached template is invalidated and the
    /// claim is recorded in history before the call returns.
    ///
    /// At most one claim per (user, template) may be in flight engine-wide,
    /// and this controller runs at most one claim at a time; violations are
    /// rejected synchronously with `ClaimError::ClaimInFlight`.
    pub async fn claim(&self, template_id: TemplateId) -> ClaimResult<ClaimEvent> {
        match self.run_claim(template_id).await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.metrics
                    .claims_failed
                    .with_label_values(&[e.error_type()])
                    .inc();
                Err(e)
            }
        }
    }

    async fn run_claim(&self, template_id: TemplateId) -> ClaimResult<ClaimEvent> {
        let Some(_guard) = self.in_flight.try_acquire(self.user, template_id) else {
            return Err(ClaimError::ClaimInFlight { template_id });
        };

        // Re-validate against current chain state before anything is
        // signed. Rejections here leave the published state untouched.
        let template = self.registry.get_by_id(template_id).await?;
        let status = self.evaluator.check(&template, self.user).await?;
        if !status.can_claim_now {
            let reason = status
                .reason
                .unwrap_or_else(|| "Not eligible".to_string());
            tracing::info!(
                "Claim of template {} by {:?} refused: {}",
                template_id,
                self.user,
                reason
            );
            return Err(ClaimError::Ineligible { reason });
        }

        let mut permitted = Ok(());
        self.state.send_modify(|state| match state.phase {
            ClaimPhase::Idle | ClaimPhase::Error => {
                *state = ClaimState {
                    phase: ClaimPhase::Claiming,
                    template_id: Some(template_id),
                    tx_hash: None,
                    card_id: None,
                    error: None,
                };
            }
            ClaimPhase::Claiming => {
                permitted = Err(ClaimError::ClaimInFlight { template_id });
            }
            ClaimPhase::Estimating => {
                permitted = Err(ClaimError::Internal("gas estimate in progress".to_string()));
            }
            ClaimPhase::Success => {
                permitted = Err(ClaimError::Internal(
                    "reset required after a completed claim".to_string(),
                ));
            }
        });
        permitted?;

        match self.submit_and_confirm(template_id).await {
            Ok(event) => {
                self.state.send_modify(|state| {
                    state.phase = ClaimPhase::Success;
                    state.card_id = Some(event.card_id);
                    state.error = None;
                });
                Ok(event)
            }
            Err(e) => {
                self.state.send_modify(|state| {
                    state.phase = ClaimPhase::Error;
                    state.error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn submit_and_confirm(&self, template_id: TemplateId) -> ClaimResult<ClaimEvent> {
        let submit_timer = self
            .metrics
            .claim_latency
            .with_label_values(&["submit"])
            .start_timer();
        let tx_hash = self.reader.submit_claim(template_id, self.signer.as_ref()).await?;
        submit_timer.observe_duration();
        self.metrics.claims_submitted.inc();
        self.state
            .send_modify(|state| state.tx_hash = Some(tx_hash));

        let confirm_timer = self
            .metrics
            .claim_latency
            .with_label_values(&["confirm"])
            .start_timer();
        let receipt = self
            .reader
            .wait_for_confirmation(
                tx_hash,
                self.config.confirmation_poll_interval,
                self.cancel.child_token(),
            )
            .await?
            .ok_or_else(|| {
                ClaimError::Internal(format!(
                    "confirmation watch for {tx_hash:?} cancelled before a receipt was observed"
                ))
            })?;
        confirm_timer.observe_duration();

        let event = extract_claim_event(&receipt, self.reader.registry_address())?;
        self.metrics.claims_confirmed.inc();
        tracing::info!(
            "Claim of template {} by {:?} confirmed: card {} in tx {:?}",
            template_id,
            self.user,
            event.card_id,
            tx_hash
        );

        // The on-chain supply moved; force a re-fetch of this template on
        // the next registry read.
        self.registry.invalidate(template_id);

        if let Some(history) = &self.history {
            // History is best effort here: the poller will pick the event
            // up anyway if the direct ingest fails.
            if let Err(e) = history.ingest_confirmed(&event).await {
                tracing::warn!("Failed to record confirmed claim in history: {e}");
            }
        }
        Ok(event)
    }

    /// Returns the machine to `Idle`. Only meaningful from a terminal
    /// phase; a reset during an active claim is ignored.
    pub fn reset(&self) {
        self.state.send_modify(|state| match state.phase {
            ClaimPhase::Idle | ClaimPhase::Success | ClaimPhase::Error => {
                *state = ClaimState::default();
            }
            ClaimPhase::Estimating | ClaimPhase::Claiming => {
                tracing::warn!("Ignoring reset while a claim is in flight");
            }
        });
    }
}
