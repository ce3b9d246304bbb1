// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTP JSON-RPC transport with per-method metrics, a concurrency cap and
//! rate-limit backoff. Every chain read and write in the engine goes
//! through this provider.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use url::{ParseError, Url};

use crate::metrics::ClaimMetrics;

const MAX_CONCURRENT_REQUESTS: usize = 8;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct MeteredClaimHttpProvider {
    inner: Http,
    metrics: Arc<ClaimMetrics>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl MeteredClaimHttpProvider {
    pub fn new(url: impl Into<Url>, metrics: Arc<ClaimMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
            semaphore: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredClaimHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, Self::Error> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("Semaphore should never be closed");

        self.metrics.rpc_queries.with_label_values(&[method]).inc();
        let timer = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let mut retry_count = 0;
        loop {
            match self.inner.request(method, &params).await {
                Ok(result) => {
                    self.metrics.node_connected.set(1);
                    timer.observe_duration();
                    return Ok(result);
                }
                Err(err) => {
                    let message = err.to_string().to_lowercase();
                    let is_rate_limited = message.contains("rate limit")
                        || message.contains("429")
                        || message.contains("too many requests")
                        || message.contains("quota exceeded")
                        || message.contains("-32005");
                    if is_rate_limited && retry_count < MAX_RATE_LIMIT_RETRIES {
                        retry_count += 1;
                        let delay = Duration::from_secs(1 << retry_count);
                        tracing::warn!(
                            "[MeteredProvider] Rate limited on {method}, retry \
                             {retry_count}/{MAX_RATE_LIMIT_RETRIES} in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.metrics.node_connected.set(0);
                    timer.observe_duration();
                    return Err(err);
                }
            }
        }
    }
}

/// Builds an ethers `Provider` backed by the metered transport.
pub fn new_metered_claim_provider(
    url: &str,
    metrics: Arc<ClaimMetrics>,
) -> Result<Provider<MeteredClaimHttpProvider>, ParseError> {
    let http = MeteredClaimHttpProvider::new(Url::parse(url)?, metrics);
    Ok(Provider::new(http))
}
