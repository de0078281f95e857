//! Observability setup: structured logging, metrics (Prometheus), tracing.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,heron=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize Prometheus metrics exporter.
/// Returns the listen address for the metrics endpoint.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record one health-monitor probe cycle.
pub fn record_probe_cycle(checks: usize, warnings: usize, errors: usize, overall: &str) {
    metrics::counter!("heron_probe_cycles_total").increment(1);
    metrics::gauge!("heron_probe_checks").set(checks as f64);
    metrics::gauge!("heron_probe_warnings").set(warnings as f64);
    metrics::gauge!("heron_probe_errors").set(errors as f64);
    // Encode overall health as numeric: 0=ok, 1=warning, 2=error, 3=critical
    let overall_num = match overall {
        "warning" => 1.0,
        "error" => 2.0,
        "critical" => 3.0,
        _ => 0.0,
    };
    metrics::gauge!("heron_overall_health").set(overall_num);
}

/// Record the outcome of one group evaluation.
pub fn record_quorum_decision(group_id: u64, has_quorum: bool, healthy: usize, total: usize) {
    let group = group_id.to_string();
    metrics::gauge!("heron_group_has_quorum", "group" => group.clone())
        .set(if has_quorum { 1.0 } else { 0.0 });
    metrics::gauge!("heron_group_healthy_nodes", "group" => group.clone()).set(healthy as f64);
    metrics::gauge!("heron_group_total_nodes", "group" => group).set(total as f64);
}

pub fn record_failover(kind: &str) {
    metrics::counter!("heron_failovers_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_split_brain_resolution() {
    metrics::counter!("heron_split_brain_resolutions_total").increment(1);
}

pub fn record_rejected_transition() {
    metrics::counter!("heron_rejected_transitions_total").increment(1);
}

pub fn record_registered_nodes(count: usize) {
    metrics::gauge!("heron_registered_nodes").set(count as f64);
}

pub fn record_api_request(route: &str, status: u16) {
    metrics::counter!(
        "heron_api_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
