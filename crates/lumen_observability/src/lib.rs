//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lumen=debug"))
}

fn fmt_layer<S>() -> fmt::Layer<S> {
    fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
}

/// Initialize the global tracing subscriber. Panics if one is already set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer())
        .init();
}

/// Like [`init_tracing`] but reports double initialisation as an error.
pub fn try_init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer())
        .try_init()?;
    Ok(())
}

/// Install the Prometheus exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Failover handled by a session: `reattached`, `recreated`, `unblocked_only`
/// or `failed`.
pub fn record_failover(outcome: &str) {
    metrics::counter!("lumen_session_failover_total", "outcome" => outcome.to_string())
        .increment(1);
}

/// One XA bridge call (`start`, `end`, `prepare`, ...) and its result.
pub fn record_xa_call(op: &str, outcome: &str) {
    metrics::counter!(
        "lumen_xa_calls_total",
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A producer had to wait for credits.
pub fn record_credit_wait(waited_us: u64, timed_out: bool) {
    metrics::counter!("lumen_credit_waits_total", "timed_out" => timed_out.to_string())
        .increment(1);
    metrics::histogram!("lumen_credit_wait_us").record(waited_us as f64);
}

/// One timeout-reaper sweep.
pub fn record_reaper_sweep(scanned: usize, timed_out: usize, failed_rollbacks: usize) {
    metrics::counter!("lumen_reaper_sweeps_total").increment(1);
    metrics::counter!("lumen_reaper_timed_out_total").increment(timed_out as u64);
    metrics::counter!("lumen_reaper_rollback_failures_total").increment(failed_rollbacks as u64);
    metrics::gauge!("lumen_xa_live_transactions").set(scanned as f64);
}

pub fn record_heuristic_completion(committed: bool) {
    metrics::counter!(
        "lumen_heuristic_completions_total",
        "committed" => committed.to_string()
    )
    .increment(1);
}
