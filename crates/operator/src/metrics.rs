use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref RECONCILIATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "daemonjob_reconciliations_total",
        "Reconciliation passes by outcome.",
        &["outcome"]
    )
    .unwrap();
    pub static ref JOB_REPLACEMENTS_TOTAL: IntCounter = register_int_counter!(
        "daemonjob_job_replacements_total",
        "Managed Jobs deleted after the API server rejected an update."
    )
    .unwrap();
    pub static ref ELIGIBLE_NODES: IntGaugeVec = register_int_gauge_vec!(
        "daemonjob_eligible_nodes",
        "Nodes matching a DaemonJob's node selector at its last reconciliation.",
        &["namespace", "name"]
    )
    .unwrap();
}

pub fn record_outcome(outcome: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

// Gather metrics from the default registry for exposition
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
