// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 6.5, 7.0, 7.5, 8.0, 8.5, 9.0, 9.5,
    10., 15., 20., 25., 30., 35., 40., 45., 50., 60., 70., 80., 90., 100., 120., 140., 160., 180.,
    200., 250., 300., 350., 400.,
];

#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct ClaimMetrics {
    // RPC transport (P0)
    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,
    pub(crate) node_connected: IntGauge,

    // Template registry cache
    pub(crate) registry_refreshes: IntCounter,
    pub(crate) registry_refresh_errors: IntCounter,
    pub(crate) registry_cache_hits: IntCounter,
    pub(crate) registry_cache_misses: IntCounter,
    pub(crate) registry_templates_cached: IntGauge,

    // Claim execution (P0) - a stuck claim is user-visible immediately
    pub(crate) claims_submitted: IntCounter,
    pub(crate) claims_confirmed: IntCounter,
    pub(crate) claims_failed: IntCounterVec,
    pub(crate) claim_latency: HistogramVec,

    // History synchronization
    pub(crate) history_events_ingested: IntCounter,
    pub(crate) history_events_deduplicated: IntCounter,
    pub(crate) listener_gaps: IntCounter,
    pub(crate) last_synced_block: IntGaugeVec,
}

impl ClaimMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            rpc_queries: register_int_counter_vec_with_registry!(
                "claim_sync_rpc_queries",
                "Total number of RPC queries issued, by method",
                &["method"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "claim_sync_rpc_queries_latency",
                "Latency of RPC queries, by method",
                &["method"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            node_connected: register_int_gauge_with_registry!(
                "claim_sync_node_connected",
                "Whether the last RPC request to the node succeeded (1) or failed (0)",
                registry,
            )
            .unwrap(),
            registry_refreshes: register_int_counter_with_registry!(
                "claim_sync_registry_refreshes",
                "Total number of template registry refreshes",
                registry,
            )
            .unwrap(),
            registry_refresh_errors: register_int_counter_with_registry!(
                "claim_sync_registry_refresh_errors",
                "Total number of template registry refreshes that failed wholesale",
                registry,
            )
            .unwrap(),
            registry_cache_hits: register_int_counter_with_registry!(
                "claim_sync_registry_cache_hits",
                "Total number of registry reads served from a fresh snapshot",
                registry,
            )
            .unwrap(),
            registry_cache_misses: register_int_counter_with_registry!(
                "claim_sync_registry_cache_misses",
                "Total number of registry reads that required a chain refresh",
                registry,
            )
            .unwrap(),
            registry_templates_cached: register_int_gauge_with_registry!(
                "claim_sync_registry_templates_cached",
                "Number of templates in the current registry snapshot",
                registry,
            )
            .unwrap(),
            claims_submitted: register_int_counter_with_registry!(
                "claim_sync_claims_submitted",
                "Total number of claim transactions broadcast",
                registry,
            )
            .unwrap(),
            claims_confirmed: register_int_counter_with_registry!(
                "claim_sync_claims_confirmed",
                "Total number of claim transactions confirmed with a CardClaimed event",
                registry,
            )
            .unwrap(),
            claims_failed: register_int_counter_vec_with_registry!(
                "claim_sync_claims_failed",
                "Total number of claim attempts that failed, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            claim_latency: register_histogram_vec_with_registry!(
                "claim_sync_claim_latency",
                "Latency of claim stages, from call to completion",
                &["stage"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            history_events_ingested: register_int_counter_with_registry!(
                "claim_sync_history_events_ingested",
                "Total number of claim history entries written to the store",
                registry,
            )
            .unwrap(),
            history_events_deduplicated: register_int_counter_with_registry!(
                "claim_sync_history_events_deduplicated",
                "Total number of claim events dropped as already ingested",
                registry,
            )
            .unwrap(),
            listener_gaps: register_int_counter_with_registry!(
                "claim_sync_listener_gaps",
                "Total number of observation gaps flagged by history listeners",
                registry,
            )
            .unwrap(),
            last_synced_block: register_int_gauge_vec_with_registry!(
                "claim_sync_last_synced_block",
                "Last block fully scanned for claim events, by user",
                &["user"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
