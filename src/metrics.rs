//! Prometheus exporter
//!
//! Counters are recorded throughout the workspace with the `metrics` macros;
//! this module only installs the global recorder and its scrape listener.
//!
//! Author: arkSong <arksong2018@gmail.com>

use std::net::{IpAddr, SocketAddr};

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, instrument};

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("Failed to install metrics exporter on {address}: {reason}")]
    Install { address: SocketAddr, reason: String },
}

/// Serve `/metrics` on `address:port` for the lifetime of the process
///
/// Must be called from within a Tokio runtime.
#[instrument(level = "debug")]
pub fn install_exporter(address: IpAddr, port: u16) -> Result<SocketAddr, MetricsError> {
    let address = SocketAddr::new(address, port);
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|err| MetricsError::Install {
            address,
            reason: err.to_string(),
        })?;

    info!("📊 Prometheus exporter listening on {}", address);
    Ok(address)
}
