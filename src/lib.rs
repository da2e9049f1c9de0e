// =============================================================================
// Matrixon Telemetry - Library Crate
// =============================================================================
//
// Project: Matrixon - Telemetry Ingestion & Analytics
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-19
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Service crate for the Matrixon telemetry pipeline: configuration,
//   logging bootstrap, metrics exporter, the viewer-facing query API and the
//   wiring that runs the ingestion adapters until shutdown.
//
// =============================================================================

pub mod api;
pub mod clap;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod service;

// Re-export workspace crates
pub use matrixon_analytics as analytics;
pub use matrixon_common as common;
pub use matrixon_iot as iot;

pub use config::{Config, ConfigError};
pub use service::{open_sink, TelemetryService};
