//! Tracing subscriber and metrics exporter installation for binaries.

use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogFormat;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info";

/// Builds the env filter: `RUST_LOG` when valid, otherwise [`DEFAULT_FILTER`].
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been set.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter());
    match format {
        LogFormat::Fmt => registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .context("failed to install tracing subscriber")?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .context("failed to install tracing subscriber")?,
    }
    Ok(())
}

/// Installs the Prometheus recorder and its scrape listener on `addr`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to install prometheus exporter on {addr}"))?;
    tracing::info!(address = %addr, "prometheus exporter listening");
    Ok(())
}
