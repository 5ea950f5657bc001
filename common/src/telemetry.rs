// Structured logging and lightweight metrics for the driver and CLI binaries.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with an optional JSON formatter and the
/// log level from configuration or the `RUST_LOG` environment variable.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("failed to create env filter: {e}"))?;

    let registry = tracing_subscriber::registry();

    if json {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter);
        registry
            .with(layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))?;
    } else {
        let layer = fmt::layer().with_target(true).with_filter(env_filter);
        registry
            .with(layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))?;
    }

    tracing::info!(log_level, json, "structured logging initialized");
    Ok(())
}

/// Install a Prometheus exporter and describe the counters/histograms this
/// crate emits. Only the `Automation`/`UrdClient` call sites increment them;
/// this module owns naming and registration.
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{metrics_port}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics port: {e}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus exporter: {e}"))?;

    describe_counter!("jobs_submitted_total", "Total number of method submissions sent to the daemon");
    describe_counter!("urd_transactions_finished_total", "Total number of urd transactions posted with finish()");
    describe_histogram!("job_wait_seconds", "Wall-clock time spent waiting for a submission to go idle");

    tracing::info!(metrics_port, "prometheus exporter initialized");
    Ok(())
}

#[inline]
pub fn record_job_submitted(method: &str) {
    counter!("jobs_submitted_total", "method" => method.to_string()).increment(1);
}

#[inline]
pub fn record_job_wait_seconds(method: &str, seconds: f64) {
    histogram!("job_wait_seconds", "method" => method.to_string()).record(seconds);
}

#[inline]
pub fn record_urd_transaction_finished(path: &str) {
    counter!("urd_transactions_finished_total", "path" => path.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_does_not_panic() {
        record_job_submitted("csvexport");
        record_job_wait_seconds("csvexport", 1.5);
        record_urd_transaction_finished("user/report");
    }
}
