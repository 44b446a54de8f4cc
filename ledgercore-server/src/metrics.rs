//! Prometheus metrics endpoint: operability metrics (journal queue depth,
//! ledger append rate, anchor lag, integrity alerts), not domain analytics.
//!
//! `lazy_static!` + `prometheus::register_*` pattern, with a `/metrics`
//! handler that gathers and text-encodes the registry.

use axum::{http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, IntCounterVec, TextEncoder};

lazy_static::lazy_static! {
    /// Total journal entries that reached each terminal status, labeled by
    /// tenant (spec §8 testable property 7: every entry reaches a terminal
    /// state; this counter is how an operator watches that happen live).
    pub static ref JOURNAL_TERMINAL: IntCounterVec = prometheus::register_int_counter_vec!(
        "ledgercore_journal_terminal_total",
        "Journal entries reaching a terminal status, by tenant and status",
        &["tenant", "status"]
    ).unwrap();

    /// Total ledger events appended, by tenant and event type.
    pub static ref LEDGER_APPENDS: IntCounterVec = prometheus::register_int_counter_vec!(
        "ledgercore_ledger_appends_total",
        "Ledger events appended, by tenant and event type",
        &["tenant", "event_type"]
    ).unwrap();

    /// Merkle anchor runs, by tenant and whether they wrote a new anchor.
    pub static ref ANCHOR_RUNS: IntCounterVec = prometheus::register_int_counter_vec!(
        "ledgercore_anchor_runs_total",
        "Merkle anchor worker iterations, by tenant and outcome",
        &["tenant", "outcome"]
    ).unwrap();

    /// Chain/anchor integrity alerts raised (spec §7 Integrity error).
    pub static ref INTEGRITY_ALERTS: IntCounterVec = prometheus::register_int_counter_vec!(
        "ledgercore_integrity_alerts_total",
        "Integrity alerts raised, by tenant and kind",
        &["tenant", "kind"]
    ).unwrap();
}

/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).expect("prometheus encoding is infallible for well-formed metrics");
    let body = String::from_utf8(buffer).expect("prometheus text encoder always emits valid UTF-8");
    (StatusCode::OK, [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")], body)
}
