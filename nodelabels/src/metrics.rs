//! Admission outcome metrics, exported in the Prometheus format.

use std::net::SocketAddr;

use anyhow::Context as _;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

pub const ADMISSION_TOTAL: &str = "node_labels_admission_total";
pub const POD_PATCH_TOTAL: &str = "node_labels_pod_patch_total";

/// Count one answered admission request.
pub(crate) fn record_admission(kind: &str, outcome: &'static str) {
    counter!(ADMISSION_TOTAL, "kind" => kind.to_string(), "outcome" => outcome).increment(1);
}

/// Count one pod patch issued on the bind path.
pub(crate) fn record_pod_patch(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(POD_PATCH_TOTAL, "result" => result).increment(1);
}

/// Install the global recorder and serve it over HTTP on `addr`.
pub fn init_prometheus_server(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install prometheus server")?;
    Ok(())
}
