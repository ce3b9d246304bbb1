// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Event-driven synchronization of the claim history. A per-user cursor
//! tracks the last fully scanned block; polling, catch-up after downtime
//! and direct ingestion of just-confirmed claims all funnel into the same
//! deduplicated store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::JsonRpcClient;
use ethers::types::Address as EthAddress;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::chain_reader::ChainReader;
use crate::config::ListenerConfig;
use crate::error::{ClaimError, ClaimResult};
use crate::events::ClaimEvent;
use crate::history::store::{ClaimQuery, ClaimStore};
use crate::metrics::ClaimMetrics;
use crate::registry::TemplateRegistry;
use crate::retry_with_max_elapsed_time;
use crate::types::{claim_entry_id, ClaimHistoryEntry, ClaimStats, TemplateId};

const BROADCAST_CAPACITY: usize = 1024;

/// Result of one synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    pub ingested: u64,
    pub deduplicated: u64,
    /// Last block covered by the pass; the cursor stands here afterwards.
    pub scanned_to: u64,
}

enum IngestOutcome {
    Ingested,
    Duplicate,
    /// Event referenced a template the registry no longer knows.
    Skipped,
}

pub struct HistorySynchronizer<P> {
    reader: Arc<ChainReader<P>>,
    registry: Arc<TemplateRegistry<P>>,
    store: Arc<dyn ClaimStore>,
    config: ListenerConfig,
    metrics: Arc<ClaimMetrics>,
    /// Last fully scanned block per user.
    cursors: RwLock<HashMap<EthAddress, u64>>,
    broadcast: broadcast::Sender<ClaimHistoryEntry>,
    cancel: CancellationToken,
}

impl<P> HistorySynchronizer<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        reader: Arc<ChainReader<P>>,
        registry: Arc<TemplateRegistry<P>>,
        store: Arc<dyn ClaimStore>,
        config: ListenerConfig,
        metrics: Arc<ClaimMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            reader,
            registry,
            store,
            config,
            metrics,
            cursors: RwLock::new(HashMap::new()),
            broadcast,
            cancel,
        }
    }

    /// Every entry ingested from now on, across all users.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClaimHistoryEntry> {
        self.broadcast.subscribe()
    }

    /// Claims matching `query`, as synchronized so far.
    pub async fn claims(&self, query: &ClaimQuery) -> ClaimResult<Vec<ClaimHistoryEntry>> {
        self.store.list(query).await
    }

    /// Aggregate claim statistics for one user.
    pub async fn claim_stats(&self, user: EthAddress) -> ClaimResult<ClaimStats> {
        self.store.stats(user).await
    }

    /// Claim counts per template since `since`, feeding the trending scores.
    pub async fn recent_claim_counts(&self, since: u64) -> ClaimResult<HashMap<TemplateId, u64>> {
        self.store.recent_claim_counts(since).await
    }

    /// Scans claim events for `user` up to the chain head and ingests them.
    ///
    /// With `from_block` unset the scan resumes after the user's cursor; if
    /// the cursor has fallen further behind than the configured catch-up
    /// bound this fails with [`ClaimError::ListenerGap`] rather than
    /// silently skipping blocks. An explicit `from_block` is always honored
    /// in full, which is also the escape hatch for backfilling across a
    /// gap. Transient RPC failures are retried with backoff per chunk.
    pub async fn sync(
        &self,
        user: EthAddress,
        from_block: Option<u64>,
    ) -> ClaimResult<SyncOutcome> {
        let latest = self.reader.latest_block().await?;
        let start = match from_block {
            Some(from) => from,
            None => match self.cursors.read().await.get(&user).copied() {
                Some(cursor) => {
                    if latest.saturating_sub(cursor) > self.config.catch_up_max_blocks {
                        return Err(ClaimError::ListenerGap {
                            last_confirmed: cursor,
                        });
                    }
                    cursor + 1
                }
                None => self.config.start_block,
            },
        };

        let mut outcome = SyncOutcome {
            scanned_to: latest,
            ..Default::default()
        };
        if start > latest {
            self.set_cursor(user, latest).await;
            return Ok(outcome);
        }

        let mut chunk_start = start;
        while chunk_start <= latest {
            let chunk_end = latest.min(chunk_start + self.config.max_block_range - 1);
            let events = match retry_with_max_elapsed_time!(
                self.reader
                    .get_claim_events_in_range(Some(user), chunk_start, chunk_end),
                self.config.max_retry_duration
            ) {
                Ok(Ok(events)) => events,
                Ok(Err(e)) | Err(e) => {
                    tracing::error!(
                        "Giving up on claim scan of blocks {}..={} for {:?}: {e}",
                        chunk_start,
                        chunk_end,
                        user
                    );
                    return Err(e);
                }
            };
            for event in events {
                match self.ingest_event(&event).await? {
                    IngestOutcome::Ingested => outcome.ingested += 1,
                    IngestOutcome::Duplicate => outcome.deduplicated += 1,
                    IngestOutcome::Skipped => {}
                }
            }
            // The cursor moves only once the chunk is fully ingested, so an
            // interrupted pass re-scans instead of skipping.
            self.set_cursor(user, chunk_end).await;
            chunk_start = chunk_end + 1;
        }

        if outcome.ingested > 0 {
            tracing::info!(
                "Synced {} new claims for {:?} through block {}",
                outcome.ingested,
                user,
                outcome.scanned_to
            );
        }
        Ok(outcome)
    }

    /// Records a claim the controller just confirmed, without waiting for
    /// the next poll. Never moves the cursor: the poller still scans the
    /// event's block and deduplicates against this entry.
    pub async fn ingest_confirmed(&self, event: &ClaimEvent) -> ClaimResult<()> {
        self.ingest_event(event).await?;
        Ok(())
    }

    /// Spawns a background task that tails new blocks for `user` claims.
    /// The cursor starts at the current head; history before that is only
    /// fetched through an explicit [`sync`](Self::sync). On a detected gap
    /// the listener clamps its cursor into the catch-up window and keeps
    /// going.
    pub async fn listen(self: &Arc<Self>, user: EthAddress) -> ClaimResult<ClaimSubscription> {
        // tokio::time::interval panics on a zero period.
        if self.config.poll_interval.is_zero() {
            return Err(ClaimError::InvalidConfig(
                "listener poll-interval must be > 0".to_string(),
            ));
        }
        let initialized = self.cursors.read().await.contains_key(&user);
        if !initialized {
            let latest = self.reader.latest_block().await?;
            self.cursors.write().await.entry(user).or_insert(latest);
        }

        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let synchronizer = self.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("Claim listener for {:?} started", user);
            let mut interval = tokio::time::interval(synchronizer.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        tracing::info!("Claim listener for {:?} shutting down", user);
                        return;
                    }
                    _ = interval.tick() => {
                        match synchronizer.sync(user, None).await {
                            Ok(outcome) => {
                                if outcome.ingested > 0 {
                                    tracing::debug!(
                                        "Listener ingested {} claims for {:?}",
                                        outcome.ingested,
                                        user
                                    );
                                }
                            }
                            Err(ClaimError::ListenerGap { last_confirmed }) => {
                                synchronizer.recover_from_gap(user, last_confirmed).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Claim sync for {:?} failed, will retry next tick: {e}",
                                    user
                                );
                            }
                        }
                    }
                }
            }
        });
        Ok(ClaimSubscription {
            cancel,
            handle: Some(handle),
        })
    }

    async fn recover_from_gap(&self, user: EthAddress, last_confirmed: u64) {
        self.metrics.listener_gaps.inc();
        let latest = match self.reader.latest_block().await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!("Gap recovery for {:?} could not read the chain head: {e}", user);
                return;
            }
        };
        let resume = latest.saturating_sub(self.config.catch_up_max_blocks);
        tracing::warn!(
            "Listener gap for {:?}: cursor at {}, resuming from {}; blocks in between \
             are only reachable via an explicit sync",
            user,
            last_confirmed,
            resume
        );
        self.cursors.write().await.insert(user, resume);
    }

    async fn ingest_event(&self, event: &ClaimEvent) -> ClaimResult<IngestOutcome> {
        let id = claim_entry_id(event.template_id, event.claimer, event.tx_hash);
        if self.store.contains(&id).await? {
            self.metrics.history_events_deduplicated.inc();
            return Ok(IngestOutcome::Duplicate);
        }

        // Denormalize the template so history entries stay renderable even
        // after the template changes or disappears.
        let collectible = match self.registry.get_by_id(event.template_id).await {
            Ok(template) => template,
            Err(ClaimError::NotFound) => {
                tracing::warn!(
                    "Dropping claim event for unknown template {} in tx {:?}",
                    event.template_id,
                    event.tx_hash
                );
                return Ok(IngestOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let entry = ClaimHistoryEntry {
            id,
            template_id: event.template_id,
            user: event.claimer,
            tx_hash: event.tx_hash,
            card_id: event.card_id,
            timestamp: event.timestamp,
            block_number: event.block_number,
            collectible,
        };
        if !self.store.upsert(entry.clone()).await? {
            // Lost the race against a concurrent ingest of the same claim.
            self.metrics.history_events_deduplicated.inc();
            return Ok(IngestOutcome::Duplicate);
        }
        self.metrics.history_events_ingested.inc();
        let _ = self.broadcast.send(entry);
        Ok(IngestOutcome::Ingested)
    }

    async fn set_cursor(&self, user: EthAddress, block: u64) {
        let mut cursors = self.cursors.write().await;
        let cursor = cursors.entry(user).or_insert(block);
        *cursor = (*cursor).max(block);
        self.metrics
            .last_synced_block
            .with_label_values(&[&format!("{user:?}")])
            .set(*cursor as i64);
    }

    #[cfg(test)]
    pub(crate) async fn cursor(&self, user: EthAddress) -> Option<u64> {
        self.cursors.read().await.get(&user).copied()
    }
}

/// Handle to a running listener task. Dropping it cancels the task;
/// [`stop`](Self::stop) cancels and waits for it to exit.
pub struct ClaimSubscription {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ClaimSubscription {
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ClaimSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
