// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ranking views over the template set: what is being claimed right now,
//! what is about to expire and what is close to selling out. Pure
//! computation - claim counts come from the history store and templates
//! from the registry snapshot.

use std::collections::HashMap;

use crate::config::TrendingConfig;
use crate::types::{Template, TemplateId, TrendingScore};

pub struct TrendingService {
    config: TrendingConfig,
}

impl TrendingService {
    pub fn new(config: TrendingConfig) -> Self {
        Self { config }
    }

    /// Claim velocity normalized into `[0, 1]`: claims per hour over the
    /// configured window, against the configured ceiling.
    fn velocity(&self, count: u64) -> f64 {
        let window_secs = self.config.window.as_secs();
        if window_secs == 0 {
            return 0.0;
        }
        let per_hour = (count as f64 * 3600.0) / window_secs as f64;
        (per_hour / self.config.velocity_ceiling).clamp(0.0, 1.0)
    }

    /// Templates ranked by claim velocity within the window, ties broken
    /// towards the higher overall supply. `counts` is claims per template
    /// over the same window; templates without recent claims rank last.
    pub fn trending(
        &self,
        templates: &[Template],
        counts: &HashMap<TemplateId, u64>,
        limit: usize,
    ) -> Vec<Template> {
        let mut ranked: Vec<(f64, &Template)> = templates
            .iter()
            .map(|template| {
                let count = counts.get(&template.template_id).copied().unwrap_or(0);
                (self.velocity(count), template)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.current_supply.cmp(&a.1.current_supply))
                .then(a.1.template_id.cmp(&b.1.template_id))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|(_, template)| template.clone())
            .collect()
    }

    /// Still-claimable templates whose end falls within the expiry window,
    /// soonest first, capped at `limit`. Open-ended templates never appear.
    pub fn expiring_soon(&self, templates: &[Template], now: u64, limit: usize) -> Vec<Template> {
        let horizon = self.config.expiry_window.as_secs();
        let mut soon: Vec<Template> = templates
            .iter()
            .filter(|t| {
                t.end_time != 0 && !t.has_ended(now) && t.end_time.saturating_sub(now) < horizon
            })
            .cloned()
            .collect();
        soon.sort_by_key(|t| (t.end_time, t.template_id));
        soon.truncate(limit);
        soon
    }

    /// Bounded templates with supply left, scarcest first, capped at
    /// `limit`. Sold-out and unbounded templates never appear.
    pub fn low_supply(&self, templates: &[Template], limit: usize) -> Vec<Template> {
        let mut low: Vec<(u64, Template)> = templates
            .iter()
            .filter_map(|t| match t.remaining_supply() {
                Some(remaining) if remaining > 0 => Some((remaining, t.clone())),
                _ => None,
            })
            .collect();
        low.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.template_id.cmp(&b.1.template_id)));
        low.into_iter()
            .take(limit)
            .map(|(_, template)| template)
            .collect()
    }

    /// Component scores for one template.
    pub fn score(&self, template: &Template, count: u64, now: u64) -> TrendingScore {
        let scarcity = match template.remaining_supply() {
            None => 0.0,
            Some(remaining) => 1.0 - remaining as f64 / template.max_supply as f64,
        };
        let urgency = if template.end_time == 0 || template.has_ended(now) {
            0.0
        } else {
            let time_left = template.end_time.saturating_sub(now) as f64;
            (1.0 - time_left / self.config.expiry_window.as_secs() as f64).clamp(0.0, 1.0)
        };
        TrendingScore {
            claim_velocity: self.velocity(count),
            scarcity,
            urgency,
        }
    }
}
