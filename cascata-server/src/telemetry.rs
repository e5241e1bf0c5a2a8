use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize logs and the Prometheus recorder. Safe to call more than once;
/// later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascata=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if PROM_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROM_HANDLE.set(handle);
        }
        Err(error) => {
            tracing::warn!("failed to install metrics recorder: {}", error);
            return;
        }
    }

    metrics::describe_counter!("cascata_saves_total", "Contexts saved through the local API");
    metrics::describe_counter!("cascata_deletes_total", "Contexts deleted through the local API");
    metrics::describe_counter!(
        "cascata_events_published_total",
        "Events published to the in-process bus"
    );
    metrics::describe_gauge!("cascata_stream_subscribers", "Open event-stream connections");
    metrics::describe_counter!(
        "cascata_stream_overflows_total",
        "Stream subscribers dropped after falling behind"
    );
    metrics::describe_counter!(
        "cascata_propagation_failures_total",
        "Per-peer propagation push failures"
    );
    metrics::describe_counter!("cascata_sync_cycles_total", "Completed catch-up passes");
    metrics::describe_counter!(
        "cascata_sync_applied_total",
        "Upstream changes applied locally"
    );
    metrics::describe_counter!("cascata_cache_hits_total", "Context cache hits");
    metrics::describe_counter!("cascata_cache_misses_total", "Context cache misses");
    metrics::describe_gauge!("cascata_node_up", "Set to 1 while the node is running");

    metrics::gauge!("cascata_node_up").set(1.0);
}

/// Render the current metrics in Prometheus exposition format.
pub fn render() -> String {
    match PROM_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# metrics recorder not installed\n".to_string(),
    }
}
