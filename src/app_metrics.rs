use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const MET_DOWNLOADS: &str = "downloads";
pub const MET_RESOLVES: &str = "resolves";
pub const MET_OAUTH: &str = "oauth";
pub const MET_WEBHOOK_EVENTS: &str = "webhook_events";
pub const CAT_STATUS: &str = "status";
pub const CAT_STEP: &str = "step";
pub const CAT_KIND: &str = "kind";

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .install_recorder()
}

/// Counts a step of the OAuth token lifecycle, e.g. `code_exchange` / `success`
pub fn record_oauth(step: &'static str, status: &'static str) {
    metrics::counter!(MET_OAUTH, CAT_STEP => step, CAT_STATUS => status).increment(1);
}
