//! Prometheus metrics for the coordination engine.
//!
//! Metrics cover:
//! - Elections (started, won, leader changes, current term)
//! - Resource grants per protocol
//! - Byzantine verdicts
//! - Checkpoints by outcome
//! - Wire messages by kind and direction, dropped messages by reason
//! - Membership gauges per status
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "meshcoord" prefix
//! to avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are logged and an unregistered metric is used
//! instead of panicking.
//!
//! Several engines in one process (multi-node tests) share these statics, so
//! per-node series carry a `node` label where it matters.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

use crate::types::NodeId;

/// Custom Prometheus registry for meshcoord metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("meshcoord".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Election metrics
// =============================================================================

define_counter_vec!(
    ELECTIONS,
    "elections_total",
    "Elections started and their outcomes",
    ["node", "outcome"]
);
define_counter_vec!(
    LEADER_CHANGES,
    "leader_changes_total",
    "Leader changes observed",
    ["node"]
);
define_gauge_vec!(
    CURRENT_TERM,
    "current_term",
    "Highest election term observed",
    ["node"]
);

// =============================================================================
// Resource metrics
// =============================================================================

define_counter_vec!(
    RESOURCE_GRANTS,
    "resource_grants_total",
    "Resource grants by protocol",
    ["protocol"]
);
define_histogram_vec!(
    RESOURCE_WAIT,
    "resource_wait_seconds",
    "Time from request to grant",
    ["protocol"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
);

// =============================================================================
// Byzantine & checkpoint metrics
// =============================================================================

define_counter_vec!(
    VERDICTS,
    "verdicts_total",
    "Byzantine agreement verdicts",
    ["verdict"]
);
define_counter_vec!(
    CHECKPOINTS,
    "checkpoints_total",
    "Checkpoints by outcome",
    ["outcome"]
);

// =============================================================================
// Message metrics
// =============================================================================

define_counter_vec!(
    MESSAGES,
    "messages_total",
    "Wire messages by kind and direction",
    ["kind", "direction"]
);
define_counter_vec!(
    DROPPED_MESSAGES,
    "dropped_messages_total",
    "Inbound messages dropped by reason",
    ["reason"]
);

// =============================================================================
// Membership metrics
// =============================================================================

define_gauge_vec!(
    MEMBERS,
    "members",
    "Members per status as seen by a node",
    ["node", "status"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Safe Registration Helpers
// =============================================================================

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
    }
    histogram
}

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*ELECTIONS;
    let _ = &*LEADER_CHANGES;
    let _ = &*CURRENT_TERM;
    let _ = &*RESOURCE_GRANTS;
    let _ = &*RESOURCE_WAIT;
    let _ = &*VERDICTS;
    let _ = &*CHECKPOINTS;
    let _ = &*MESSAGES;
    let _ = &*DROPPED_MESSAGES;
    let _ = &*MEMBERS;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_election(node: NodeId, outcome: &str) {
    ELECTIONS
        .with_label_values(&[&node.to_string(), outcome])
        .inc();
}

pub fn record_leader_change(node: NodeId, term: u64) {
    let label = node.to_string();
    LEADER_CHANGES.with_label_values(&[&label]).inc();
    CURRENT_TERM.with_label_values(&[&label]).set(term as i64);
}

pub fn set_current_term(node: NodeId, term: u64) {
    CURRENT_TERM
        .with_label_values(&[&node.to_string()])
        .set(term as i64);
}

pub fn record_grant(protocol: &str, wait_secs: f64) {
    RESOURCE_GRANTS.with_label_values(&[protocol]).inc();
    RESOURCE_WAIT.with_label_values(&[protocol]).observe(wait_secs);
}

pub fn record_verdict(verdict: &str) {
    VERDICTS.with_label_values(&[verdict]).inc();
}

pub fn record_checkpoint(outcome: &str) {
    CHECKPOINTS.with_label_values(&[outcome]).inc();
}

pub fn record_message(kind: &str, direction: &str) {
    MESSAGES.with_label_values(&[kind, direction]).inc();
}

pub fn record_dropped(reason: &str) {
    DROPPED_MESSAGES.with_label_values(&[reason]).inc();
}

pub fn set_member_count(node: NodeId, status: &str, count: usize) {
    MEMBERS
        .with_label_values(&[&node.to_string(), status])
        .set(count as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_encoded_output_uses_prefix() {
        record_verdict("faulty");
        let text = encode_metrics().unwrap();
        assert!(text.contains("meshcoord_verdicts_total"));
    }

    #[test]
    fn test_counters_increase() {
        let before = DROPPED_MESSAGES.with_label_values(&["stale_term"]).get();
        record_dropped("stale_term");
        let after = DROPPED_MESSAGES.with_label_values(&["stale_term"]).get();
        assert!(after > before);
    }

    #[test]
    fn test_leader_change_sets_term_gauge() {
        record_leader_change(NodeId(77), 12);
        assert_eq!(CURRENT_TERM.with_label_values(&["node-77"]).get(), 12);
    }
}
