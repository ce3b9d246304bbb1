// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! TTL-bounded cache over the on-chain template registry. Owns the only
//! cached template state in the engine; every consumer goes through an
//! injected instance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ethers::providers::JsonRpcClient;
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use crate::chain_reader::ChainReader;
use crate::config::{DiscoveryStrategy, RegistryConfig};
use crate::error::{ClaimError, ClaimResult};
use crate::metrics::ClaimMetrics;
use crate::types::{Template, TemplateId};

struct Snapshot {
    templates: Arc<Vec<Template>>,
    fetched_at: Instant,
}

pub struct TemplateRegistry<P> {
    reader: Arc<ChainReader<P>>,
    config: RegistryConfig,
    metrics: Arc<ClaimMetrics>,
    snapshot: RwLock<Option<Snapshot>>,
    /// Ids whose cached entry is suspect (e.g. after a confirmed claim).
    pending_invalidations: Mutex<HashSet<TemplateId>>,
    /// Serializes refreshes so concurrent `get_all` callers coalesce.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<P> TemplateRegistry<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        reader: Arc<ChainReader<P>>,
        config: RegistryConfig,
        metrics: Arc<ClaimMetrics>,
    ) -> Self {
        Self {
            reader,
            config,
            metrics,
            snapshot: RwLock::new(None),
            pending_invalidations: Mutex::new(HashSet::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the template set, refreshing from chain when the snapshot is
    /// older than the TTL, carries pending invalidations, or `force_refresh`
    /// is set. The returned snapshot is immutable and swapped whole - callers
    /// never observe a half-updated set.
    pub async fn get_all(&self, force_refresh: bool) -> ClaimResult<Arc<Vec<Template>>> {
        if !force_refresh {
            if let Some(templates) = self.fresh_snapshot().await {
                self.metrics.registry_cache_hits.inc();
                return Ok(templates);
            }
        }
        self.metrics.registry_cache_misses.inc();

        let _refresh = self.refresh_lock.lock().await;
        if !force_refresh {
            // Another caller may have refreshed while we waited for the lock.
            if let Some(templates) = self.fresh_snapshot().await {
                return Ok(templates);
            }
            if self.is_within_ttl().await {
                // Only the marked ids are suspect: patch them instead of
                // refetching the whole registry.
                return self.apply_invalidations().await;
            }
        }
        self.refresh().await
    }

    pub async fn get_by_id(&self, template_id: TemplateId) -> ClaimResult<Template> {
        let templates = self.get_all(false).await?;
        templates
            .iter()
            .find(|t| t.template_id == template_id)
            .cloned()
            .ok_or(ClaimError::NotFound)
    }

    /// Marks one id for re-fetch on the next `get_all`, even inside the TTL
    /// window. Used after a confirmed claim changes `current_supply`.
    pub fn invalidate(&self, template_id: TemplateId) {
        tracing::debug!("Marking template {template_id} for re-fetch");
        self.pending_invalidations
            .lock()
            .unwrap()
            .insert(template_id);
    }

    /// Fresh snapshot with no pending invalidations, if one exists.
    async fn fresh_snapshot(&self) -> Option<Arc<Vec<Template>>> {
        let guard = self.snapshot.read().await;
        let snapshot = guard.as_ref()?;
        if snapshot.fetched_at.elapsed() >= self.config.cache_ttl {
            return None;
        }
        if !self.pending_invalidations.lock().unwrap().is_empty() {
            return None;
        }
        Some(snapshot.templates.clone())
    }

    async fn is_within_ttl(&self) -> bool {
        let guard = self.snapshot.read().await;
        matches!(guard.as_ref(), Some(s) if s.fetched_at.elapsed() < self.config.cache_ttl)
    }

    /// Re-fetches just the marked ids and patches the snapshot in one write.
    /// A NotFound drops the id; a transient failure keeps the mark so the
    /// next `get_all` retries the patch.
    async fn apply_invalidations(&self) -> ClaimResult<Arc<Vec<Template>>> {
        let marked: Vec<TemplateId> = {
            let mut pending = self.pending_invalidations.lock().unwrap();
            std::mem::take(&mut *pending).into_iter().collect()
        };

        let mut replacements: HashMap<TemplateId, Template> = HashMap::new();
        let mut dropped: HashSet<TemplateId> = HashSet::new();
        for template_id in marked {
            match self.reader.get_template(template_id).await {
                Ok(template) => {
                    replacements.insert(template_id, template);
                }
                Err(ClaimError::NotFound) => {
                    tracing::info!("Invalidated template {template_id} no longer exists, dropping");
                    dropped.insert(template_id);
                }
                Err(e) => {
                    tracing::warn!("Re-fetch of invalidated template {template_id} failed: {e}");
                    self.pending_invalidations.lock().unwrap().insert(template_id);
                }
            }
        }

        let mut guard = self.snapshot.write().await;
        match guard.as_mut() {
            Some(snapshot) => {
                let mut templates: Vec<Template> = snapshot.templates.as_ref().clone();
                templates.retain(|t| !dropped.contains(&t.template_id));
                for template in templates.iter_mut() {
                    if let Some(replacement) = replacements.remove(&template.template_id) {
                        *template = replacement;
                    }
                }
                // An invalidated id the snapshot never held (e.g. created
                // after the last full refresh) is appended.
                templates.extend(replacements.into_values());
                templates.sort_by_key(|t| t.template_id);

                let templates = Arc::new(templates);
                snapshot.templates = templates.clone();
                self.metrics
                    .registry_templates_cached
                    .set(templates.len() as i64);
                Ok(templates)
            }
            None => {
                drop(guard);
                self.refresh().await
            }
        }
    }

    async fn refresh(&self) -> ClaimResult<Arc<Vec<Template>>> {
        self.metrics.registry_refreshes.inc();
        let taken: HashSet<TemplateId> = {
            let mut pending = self.pending_invalidations.lock().unwrap();
            std::mem::take(&mut *pending)
        };

        let fetched = match self.config.discovery {
            DiscoveryStrategy::Enumerate => self.fetch_enumerated().await,
            DiscoveryStrategy::Probe => self.probe_templates().await,
        };
        let mut templates = match fetched {
            Ok(templates) => templates,
            Err(e) => {
                // The marks were not covered by a successful refresh; put
                // them back.
                self.pending_invalidations.lock().unwrap().extend(taken);
                return self.stale_snapshot_or(e).await;
            }
        };
        templates.sort_by_key(|t| t.template_id);

        let templates = Arc::new(templates);
        {
            let mut guard = self.snapshot.write().await;
            *guard = Some(Snapshot {
                templates: templates.clone(),
                fetched_at: Instant::now(),
            });
        }
        self.metrics
            .registry_templates_cached
            .set(templates.len() as i64);
        tracing::info!("Registry refreshed: {} templates cached", templates.len());
        Ok(templates)
    }

    async fn fetch_enumerated(&self) -> ClaimResult<Vec<Template>> {
        let ids = self.reader.get_all_template_ids().await?;
        self.fetch_templates(ids).await
    }

    /// Fan-out fetch with bounded concurrency. Per-id failures are logged
    /// and skipped - one bad id never aborts a refresh - but if every fetch
    /// fails the refresh counts as failed wholesale.
    async fn fetch_templates(&self, ids: Vec<TemplateId>) -> ClaimResult<Vec<Template>> {
        let total = ids.len();
        let results: Vec<(TemplateId, ClaimResult<Template>)> = stream::iter(ids)
            .map(|id| async move { (id, self.reader.get_template(id).await) })
            .buffer_unordered(self.config.fetch_concurrency)
            .collect()
            .await;

        let mut templates = Vec::with_capacity(total);
        let mut failures = 0usize;
        for (template_id, result) in results {
            match result {
                Ok(template) => templates.push(template),
                Err(ClaimError::NotFound) => {
                    // Zero-issuer sentinel: the id was enumerated but holds
                    // no template.
                    tracing::debug!("Template {template_id} resolved to the zero-issuer sentinel, dropping");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Failed to fetch template {template_id} during refresh, skipping: {e}");
                }
            }
        }
        if total > 0 && templates.is_empty() && failures > 0 {
            return Err(ClaimError::Rpc(format!(
                "all {failures} template fetches failed"
            )));
        }
        Ok(templates)
    }

    /// Sequential probe from id 1 until the registry answers NotFound.
    /// Assumes gap-free monotonic id assignment; the cap guarantees
    /// termination on an empty or unexpectedly large registry.
    async fn probe_templates(&self) -> ClaimResult<Vec<Template>> {
        let mut templates = Vec::new();
        for template_id in 1..=self.config.probe_cap {
            match self.reader.get_template(template_id).await {
                Ok(template) => templates.push(template),
                Err(ClaimError::NotFound) => return Ok(templates),
                // A transport failure mid-probe aborts the refresh:
                // truncating here would silently shrink the template set.
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(
            "Probe discovery hit the cap of {} ids without a NotFound",
            self.config.probe_cap
        );
        Ok(templates)
    }

    async fn stale_snapshot_or(&self, error: ClaimError) -> ClaimResult<Arc<Vec<Template>>> {
        self.metrics.registry_refresh_errors.inc();
        let guard = self.snapshot.read().await;
        match guard.as_ref() {
            Some(snapshot) => {
                tracing::warn!(
                    "Registry refresh failed, serving stale snapshot of {} templates: {error}",
                    snapshot.templates.len()
                );
                Ok(snapshot.templates.clone())
            }
            None => Err(error),
        }
    }
}
