// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use url::Url;

/// Top-level configuration for the claim engine.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    // Rpc url of the fullnode used for every read and write.
    pub rpc_url: String,
    // The collectible template registry contract address.
    pub registry_address: String,
    // When set, the connected node's chain id must match or startup fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_chain_id: Option<u64>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub trending: TrendingConfig,
}

/// How template ids are discovered during a registry refresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryStrategy {
    /// One `getAllTemplateIds` call, then per-id fetches.
    #[default]
    Enumerate,
    /// Sequential `getTemplate(1..)` until NotFound. Assumes gap-free
    /// monotonic ids; kept as a fallback for registries without the
    /// id-list accessor.
    Probe,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// How long a template snapshot is served without a chain refresh.
    /// Whole seconds on the wire.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: Duration,
    /// Maximum number of in-flight per-template fetches during a refresh.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default)]
    pub discovery: DiscoveryStrategy,
    /// Upper bound on sequential probing so an empty registry terminates.
    #[serde(default = "default_probe_cap")]
    pub probe_cap: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            fetch_concurrency: default_fetch_concurrency(),
            discovery: DiscoveryStrategy::default(),
            probe_cap: default_probe_cap(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(240)
}

fn default_fetch_concurrency() -> usize {
    8
}

fn default_probe_cap() -> u64 {
    512
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClaimConfig {
    /// Upper bound on one gas estimation call.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_estimate_timeout")]
    pub estimate_timeout: Duration,
    /// Interval between receipt polls while waiting for confirmation.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_confirmation_poll_interval")]
    pub confirmation_poll_interval: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            estimate_timeout: default_estimate_timeout(),
            confirmation_poll_interval: default_confirmation_poll_interval(),
        }
    }
}

fn default_estimate_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_confirmation_poll_interval() -> Duration {
    Duration::from_secs(2)
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerConfig {
    /// Interval between listener log polls.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Maximum number of blocks in a single log query. Larger ranges are
    /// chunked.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// Maximum number of blocks re-scanned when recovering from a flagged
    /// listener gap. Anything older needs an explicit `sync`.
    #[serde(default = "default_catch_up_max_blocks")]
    pub catch_up_max_blocks: u64,
    /// Maximum retry duration for transient log-query failures.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_max_retry_duration")]
    pub max_retry_duration: Duration,
    /// First block considered when a user has no sync cursor yet.
    #[serde(default)]
    pub start_block: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_block_range: default_max_block_range(),
            catch_up_max_blocks: default_catch_up_max_blocks(),
            max_retry_duration: default_max_retry_duration(),
            start_block: 0,
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(12)
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_catch_up_max_blocks() -> u64 {
    5000
}

fn default_max_retry_duration() -> Duration {
    Duration::from_secs(30)
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrendingConfig {
    /// Trailing window over which claim activity counts.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_trending_window")]
    pub window: Duration,
    /// Claims per hour that map to a velocity of 1.0.
    #[serde(default = "default_velocity_ceiling")]
    pub velocity_ceiling: f64,
    /// Templates expiring within this window rank as "expiring soon".
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_expiry_window")]
    pub expiry_window: Duration,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self {
            window: default_trending_window(),
            velocity_ceiling: default_velocity_ceiling(),
            expiry_window: default_expiry_window(),
        }
    }
}

fn default_trending_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_velocity_ceiling() -> f64 {
    60.0
}

fn default_expiry_window() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

impl EngineConfig {
    /// Parsed registry contract address.
    pub fn registry_address(&self) -> anyhow::Result<EthAddress> {
        let address = EthAddress::from_str(&self.registry_address)
            .map_err(|e| anyhow!("Invalid registry-address `{}`: {e}", self.registry_address))?;
        if address == EthAddress::zero() {
            return Err(anyhow!("registry-address must not be the zero address"));
        }
        Ok(address)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        Url::parse(&self.rpc_url).map_err(|e| anyhow!("Invalid rpc-url `{}`: {e}", self.rpc_url))?;
        self.registry_address()?;

        if self.registry.cache_ttl.is_zero() {
            return Err(anyhow!("registry.cache-ttl must be > 0"));
        }
        if self.registry.fetch_concurrency == 0 {
            return Err(anyhow!("registry.fetch-concurrency must be > 0"));
        }
        if self.registry.probe_cap == 0 {
            return Err(anyhow!("registry.probe-cap must be > 0"));
        }
        if self.claim.estimate_timeout.is_zero() {
            return Err(anyhow!("claim.estimate-timeout must be > 0"));
        }
        if self.claim.confirmation_poll_interval.is_zero() {
            return Err(anyhow!("claim.confirmation-poll-interval must be > 0"));
        }
        if self.listener.poll_interval.is_zero() {
            return Err(anyhow!("listener.poll-interval must be > 0"));
        }
        if self.listener.max_block_range == 0 {
            return Err(anyhow!("listener.max-block-range must be > 0"));
        }
        if self.listener.catch_up_max_blocks == 0 {
            return Err(anyhow!("listener.catch-up-max-blocks must be > 0"));
        }
        if self.trending.window.is_zero() {
            return Err(anyhow!("trending.window must be > 0"));
        }
        if !(self.trending.velocity_ceiling.is_finite() && self.trending.velocity_ceiling > 0.0) {
            return Err(anyhow!("trending.velocity-ceiling must be a positive number"));
        }
        if self.trending.expiry_window.is_zero() {
            return Err(anyhow!("trending.expiry-window must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            rpc_url: "http://localhost:8545".to_string(),
            registry_address: format!("{:?}", EthAddress::repeat_byte(0xaa)),
            expected_chain_id: Some(1),
            registry: RegistryConfig::default(),
            claim: ClaimConfig::default(),
            listener: ListenerConfig::default(),
            trending: TrendingConfig::default(),
        }
    }

    #[test]
    fn test_defaults_pass_validation() {
        let config = valid_config();
        config.validate().unwrap();
        assert_eq!(config.registry.cache_ttl, Duration::from_secs(240));
        assert_eq!(config.registry.discovery, DiscoveryStrategy::Enumerate);
        assert_eq!(config.listener.max_block_range, 1000);
    }

    #[test]
    fn test_rejects_bad_rpc_url() {
        let mut config = valid_config();
        config.rpc_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_registry_address() {
        let mut config = valid_config();
        config.registry_address = "0x1234".to_string();
        assert!(config.validate().is_err());

        config.registry_address = format!("{:?}", EthAddress::zero());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_bounds() {
        let mut config = valid_config();
        config.registry.cache_ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.registry.fetch_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.listener.max_block_range = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.trending.velocity_ceiling = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.trending.velocity_ceiling = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kebab_case_deserialization() {
        let raw = serde_json::json!({
            "rpc-url": "http://localhost:8545",
            "registry-address": format!("{:?}", EthAddress::repeat_byte(0xaa)),
            "expected-chain-id": 11155111,
            "registry": { "discovery": "probe", "probe-cap": 64, "cache-ttl": 300 },
            "listener": { "max-block-range": 500 },
        });
        let config: EngineConfig = serde_json::from_value(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.expected_chain_id, Some(11155111));
        assert_eq!(config.registry.discovery, DiscoveryStrategy::Probe);
        assert_eq!(config.registry.probe_cap, 64);
        // Durations ride as plain seconds.
        assert_eq!(config.registry.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.listener.max_block_range, 500);
        // Untouched sections fall back to defaults.
        assert_eq!(config.claim.estimate_timeout, Duration::from_secs(15));
    }
}
