//! Maindata Aggregator (spec §4.6): the specialised merge for
//! `/api/v2/sync/maindata` plus the numeric roll-up sourced from
//! `/api/v2/transfer/info`.

use std::collections::HashMap;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::executor::{self, FanOutResponse};
use crate::instance::OutboundRequest;
use crate::json_tree::{collision_replace, JsonTree};
use crate::merge::{self, MergeMode};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reduction {
    Sum,
    Avg,
}

pub struct StatMetric {
    pub key: &'static str,
    pub reduction: Reduction,
    pub retain: bool,
}

/// `dht_nodes` is listed twice in the canonical table (a copy-paste
/// artifact carried over from the source data); deduplicated by key at
/// construction regardless of whether a given literal list repeats a key
/// (spec §9 Open Questions).
const RAW_TRANSFER_METRICS: &[(&str, Reduction, bool)] = &[
    ("dht_nodes", Reduction::Sum, false),
    ("dht_nodes", Reduction::Sum, false),
    ("dl_info_data", Reduction::Sum, false),
    ("dl_info_speed", Reduction::Sum, false),
    ("dl_rate_limit", Reduction::Sum, false),
    ("up_info_data", Reduction::Sum, false),
    ("up_info_speed", Reduction::Sum, false),
    ("up_rate_limit", Reduction::Sum, false),
];

/// Lifetime counters read from `sync/maindata`'s merged `server_state`,
/// retained per-instance across calls (spec §3, §4.6).
const RAW_RETAINED_METRICS: &[(&str, Reduction, bool)] =
    &[("alltime_dl", Reduction::Sum, true), ("alltime_ul", Reduction::Sum, true)];

pub static TRANSFER_METRICS: Lazy<Vec<StatMetric>> = Lazy::new(|| dedup_metrics(RAW_TRANSFER_METRICS));
pub static RETAINED_METRICS: Lazy<Vec<StatMetric>> = Lazy::new(|| dedup_metrics(RAW_RETAINED_METRICS));

fn dedup_metrics(raw: &[(&'static str, Reduction, bool)]) -> Vec<StatMetric> {
    let mut seen = std::collections::HashSet::new();
    raw.iter()
        .filter(|(key, _, _)| seen.insert(*key))
        .map(|(key, reduction, retain)| StatMetric { key, reduction: *reduction, retain: *retain })
        .collect()
}

/// Per-instance running values for `retain = true` metrics.
pub struct Statistics {
    values: DashMap<(usize, &'static str), f64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self { values: DashMap::new() }
    }

    pub fn observe(&self, instance_idx: usize, key: &'static str, value: f64) {
        self.values.insert((instance_idx, key), value);
    }

    /// Sums every instance's last-observed value for `key`, including
    /// instances that didn't respond this round (spec §4.6 "retain").
    pub fn sum_retained(&self, key: &'static str) -> f64 {
        self.values.iter().filter(|entry| entry.key().1 == key).map(|entry| *entry.value()).sum()
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fans out `sync/maindata` (object-merged with the replace-collision
/// policy) and `transfer/info` (summed/averaged per the static table),
/// writes the reduced values into `server_state.<key>`, overwriting
/// whatever the merge produced, and re-encodes the body.
pub async fn aggregate(engine: &Engine, request: &OutboundRequest) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let transfer_request = OutboundRequest::synthetic("/api/v2/transfer/info");

    let (maindata_outcomes, transfer_outcomes) = tokio::join!(
        executor::parallel_responses(
            &engine.registry,
            request,
            None::<fn(usize) -> bool>,
            None::<fn(usize, &FanOutResponse) -> std::result::Result<(), String>>,
        ),
        executor::parallel_responses(
            &engine.registry,
            &transfer_request,
            None::<fn(usize) -> bool>,
            None::<fn(usize, &FanOutResponse) -> std::result::Result<(), String>>,
        ),
    );

    let errors = executor::collect_errors(&maindata_outcomes);
    if !errors.is_empty() {
        return Err(Error::FanOut(errors.join("; ")));
    }

    let mut bodies = Vec::with_capacity(maindata_outcomes.len());
    let mut first_headers: Option<HeaderMap> = None;

    for outcome in &maindata_outcomes {
        let Some(response) = &outcome.response else { continue };
        if first_headers.is_none() {
            first_headers = Some(response.headers.clone());
        }
        let parsed: Value = serde_json::from_slice(&response.body)?;

        for metric in RETAINED_METRICS.iter() {
            let path = format!("server_state.{}", metric.key);
            if let Some(value) = crate::json_tree::get_path(&parsed, &path).and_then(Value::as_f64) {
                engine.stats.observe(outcome.instance_index, metric.key, value);
            }
        }

        bodies.push(parsed);
    }

    let merged = merge::merge(bodies, MergeMode::Object { collision: Some(&collision_replace) });

    let mut sums: HashMap<&'static str, f64> = HashMap::new();
    let mut counts: HashMap<&'static str, u32> = HashMap::new();

    for outcome in &transfer_outcomes {
        let Some(response) = &outcome.response else { continue };
        let Ok(parsed) = serde_json::from_slice::<Value>(&response.body) else { continue };
        for metric in TRANSFER_METRICS.iter() {
            if let Some(value) = parsed.get(metric.key).and_then(Value::as_f64) {
                *sums.entry(metric.key).or_insert(0.0) += value;
                *counts.entry(metric.key).or_insert(0) += 1;
            }
        }
    }

    let mut tree = JsonTree::new(merged);

    for metric in TRANSFER_METRICS.iter() {
        let sum = sums.get(metric.key).copied().unwrap_or(0.0);
        let reduced = match metric.reduction {
            Reduction::Sum => sum,
            Reduction::Avg => {
                let n = counts.get(metric.key).copied().unwrap_or(0);
                if n == 0 { 0.0 } else { sum / f64::from(n) }
            }
        };
        tree.set(&format!("server_state.{}", metric.key), serde_json::json!(reduced));
    }

    for metric in RETAINED_METRICS.iter() {
        let total = engine.stats.sum_retained(metric.key);
        tree.set(&format!("server_state.{}", metric.key), serde_json::json!(total));
    }

    let encoded = if engine.config.multiplexer.format.pretty_print {
        serde_json::to_vec_pretty(tree.value())?
    } else {
        serde_json::to_vec(tree.value())?
    };

    Ok((StatusCode::OK, first_headers.unwrap_or_default(), Bytes::from(encoded)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_metrics_table_dedups_dht_nodes() {
        let count = TRANSFER_METRICS.iter().filter(|m| m.key == "dht_nodes").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn retained_metrics_are_marked_retain_true() {
        assert!(RETAINED_METRICS.iter().all(|m| m.retain));
    }

    #[test]
    fn transfer_metrics_are_not_retained() {
        assert!(TRANSFER_METRICS.iter().all(|m| !m.retain));
    }

    #[test]
    fn statistics_sum_is_commutative_across_instance_order() {
        let stats = Statistics::new();
        stats.observe(0, "alltime_dl", 1000.0);
        stats.observe(1, "alltime_dl", 500.0);
        let forward = stats.sum_retained("alltime_dl");

        let stats_reversed = Statistics::new();
        stats_reversed.observe(1, "alltime_dl", 500.0);
        stats_reversed.observe(0, "alltime_dl", 1000.0);
        let backward = stats_reversed.sum_retained("alltime_dl");

        assert_eq!(forward, backward);
        assert_eq!(forward, 1500.0);
    }

    #[test]
    fn statistics_retains_last_value_per_instance_across_observations() {
        let stats = Statistics::new();
        stats.observe(0, "alltime_dl", 1000.0);
        stats.observe(0, "alltime_dl", 1200.0);
        stats.observe(1, "alltime_dl", 500.0);
        // instance 1 doesn't report again, its last value still counts
        assert_eq!(stats.sum_retained("alltime_dl"), 1700.0);
    }
}
