// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A mock Ethereum JSON-RPC transport for tests.

use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, MockError};
use ethers::types::Bytes;
use serde::de::{DeserializeOwned, Error as _};
use serde::Serialize;
use serde_json::Value;

// Mock transport used in test environments. Responses are resolved in
// order: injected errors, exact (method, params) presets, calldata presets
// for eth_call, then per-method wildcards.
#[derive(Clone, Debug, Default)]
pub struct MockClaimProvider {
    responses: Arc<Mutex<HashMap<(String, String), Value>>>,
    /// eth_call responses keyed by the request calldata only, so block tags
    /// and other envelope fields don't matter to the preset.
    call_responses: Arc<Mutex<HashMap<String, Value>>>,
    wildcards: Arc<Mutex<HashMap<String, Value>>>,
    errors: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    request_counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl MockClaimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presets the response for an exact `(method, params)` pair. A later
    /// call with the same pair replaces the previous response.
    pub fn add_response<T: Serialize + Send + Sync, K: Borrow<R>, R: Serialize>(
        &self,
        method: &str,
        params: T,
        data: K,
    ) -> Result<(), MockError> {
        let params = serde_json::to_value(params)?.to_string();
        let value = serde_json::to_value(data.borrow())?;
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_owned(), params), value);
        Ok(())
    }

    /// Presets an eth_call response keyed by calldata alone.
    pub fn add_call_response<K: Borrow<R>, R: Serialize>(
        &self,
        calldata: &Bytes,
        data: K,
    ) -> Result<(), MockError> {
        let Value::String(key) = serde_json::to_value(calldata)? else {
            return Err(MockError::SerdeJson(serde_json::Error::custom(
                "calldata must serialize to a string",
            )));
        };
        let value = serde_json::to_value(data.borrow())?;
        self.call_responses.lock().unwrap().insert(key, value);
        Ok(())
    }

    /// Presets a response returned for any request of `method` that has no
    /// more specific preset.
    pub fn add_wildcard_response<K: Borrow<R>, R: Serialize>(
        &self,
        method: &str,
        data: K,
    ) -> Result<(), MockError> {
        let value = serde_json::to_value(data.borrow())?;
        self.wildcards
            .lock()
            .unwrap()
            .insert(method.to_owned(), value);
        Ok(())
    }

    /// Queues one transport error for `method`; it is consumed by the next
    /// request ahead of any preset response.
    pub fn push_error(&self, method: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .entry(method.to_owned())
            .or_default()
            .push_back(message.to_owned());
    }

    pub fn request_count(&self, method: &str) -> u64 {
        self.request_counts
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }
}

fn call_data_of(params: &Value) -> Option<&str> {
    params.get(0)?.get("data")?.as_str()
}

#[async_trait]
impl JsonRpcClient for MockClaimProvider {
    type Error = MockError;

    async fn request<T: Serialize + Send + Sync, R: DeserializeOwned>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, MockError> {
        *self
            .request_counts
            .lock()
            .unwrap()
            .entry(method.to_owned())
            .or_default() += 1;

        if let Some(message) = self
            .errors
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|queue| queue.pop_front())
        {
            return Err(MockError::SerdeJson(serde_json::Error::custom(message)));
        }

        let params = serde_json::to_value(params)?;
        let key = (method.to_owned(), params.to_string());
        if let Some(value) = self.responses.lock().unwrap().get(&key) {
            return Ok(serde_json::from_value(value.clone())?);
        }
        if method == "eth_call" {
            if let Some(calldata) = call_data_of(&params) {
                if let Some(value) = self.call_responses.lock().unwrap().get(calldata) {
                    return Ok(serde_json::from_value(value.clone())?);
                }
            }
        }
        if let Some(value) = self.wildcards.lock().unwrap().get(method) {
            return Ok(serde_json::from_value(value.clone())?);
        }
        Err(MockError::EmptyResponses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    #[tokio::test]
    async fn test_exact_preset_beats_wildcard() {
        let provider = MockClaimProvider::new();
        provider
            .add_wildcard_response("eth_blockNumber", U64::from(1))
            .unwrap();
        provider
            .add_response("eth_blockNumber", (), U64::from(7))
            .unwrap();

        let block: U64 = provider.request("eth_blockNumber", ()).await.unwrap();
        assert_eq!(block, U64::from(7));
        assert_eq!(provider.request_count("eth_blockNumber"), 1);
    }

    #[tokio::test]
    async fn test_error_queue_consumed_first() {
        let provider = MockClaimProvider::new();
        provider
            .add_response("eth_blockNumber", (), U64::from(7))
            .unwrap();
        provider.push_error("eth_blockNumber", "connection reset");

        let err = provider
            .request::<_, U64>("eth_blockNumber", ())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        // Only one error was queued; the preset answers afterwards.
        let block: U64 = provider.request("eth_blockNumber", ()).await.unwrap();
        assert_eq!(block, U64::from(7));
        assert_eq!(provider.request_count("eth_blockNumber"), 2);
    }

    #[tokio::test]
    async fn test_unmatched_request_errors() {
        let provider = MockClaimProvider::new();
        assert!(matches!(
            provider.request::<_, U64>("eth_blockNumber", ()).await,
            Err(MockError::EmptyResponses)
        ));
    }
}
