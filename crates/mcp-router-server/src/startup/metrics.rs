// Metric descriptions and the Prometheus exporter

use std::net::SocketAddr;

use anyhow::Context;
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Describe every metric recorded by the router components.
pub fn describe_metrics() {
    describe_counter!(
        "mcp_router_route_total",
        "Total number of instance selections by outcome"
    );
    describe_histogram!(
        "mcp_router_route_latency_ms",
        Unit::Milliseconds,
        "Instance selection latency"
    );
    describe_counter!(
        "mcp_router_probe_total",
        "Total number of health probes by result"
    );
    describe_counter!(
        "mcp_router_registration_total",
        "Total number of registrations by result"
    );
    describe_counter!(
        "mcp_router_circuit_transitions_total",
        "Total number of circuit breaker transitions by target state"
    );
    describe_counter!(
        "mcp_router_audit_dropped_total",
        "Total number of audit events dropped on a full channel"
    );
}

pub fn parse_listen_addr(listen: &str) -> anyhow::Result<SocketAddr> {
    listen
        .trim()
        .parse()
        .with_context(|| format!("Invalid metrics.listen address: {}", listen))
}

/// Install the Prometheus exporter on `listen`. Must run inside the tokio runtime.
pub fn init_metrics(listen: Option<&str>) -> anyhow::Result<()> {
    let Some(listen) = listen else {
        return Ok(());
    };
    let addr = parse_listen_addr(listen)?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    describe_metrics();

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
