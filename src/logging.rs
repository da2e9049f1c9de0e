//! Logging bootstrap
//!
//! Console output through `tracing-subscriber`, plus an optional
//! daily-rotated file written through a non-blocking `tracing-appender`
//! worker. `RUST_LOG` takes precedence over the configured directive.
//!
//! Author: arkSong <arksong2018@gmail.com>

use tracing::{debug, info, instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console and optional file layers under the level filter
pub type TelemetrySubscriber = Layered<EnvFilter, Layered<Vec<BoxedLayer>, Registry>>;

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },

    #[error("Failed to set global subscriber: {0}")]
    Install(String),
}

/// Filter from `RUST_LOG`, falling back to `directive`
pub fn env_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .map_err(|err| LoggingError::Filter {
            directive: directive.to_string(),
            reason: err.to_string(),
        })
}

fn console_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).with_level(true).boxed()
    }
}

/// Assemble the subscriber without installing it
///
/// The returned guard flushes the file writer on drop.
pub fn build_subscriber(
    directive: &str,
    config: &LoggingConfig,
) -> Result<(TelemetrySubscriber, Option<WorkerGuard>), LoggingError> {
    let filter = env_filter(directive)?;
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.json)];

    let guard = match &config.directory {
        Some(directory) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
            layers.push(if config.json {
                file_layer.json().boxed()
            } else {
                file_layer.boxed()
            });
            Some(guard)
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    Ok((subscriber, guard))
}

/// Install the global subscriber
///
/// The returned guard must be kept alive for the lifetime of the process.
#[instrument(level = "debug", skip(config))]
pub fn init(directive: &str, config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let (subscriber, guard) = build_subscriber(directive, config)?;
    subscriber
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))?;

    info!("✅ Logging initialized ({})", directive);
    if let Some(directory) = &config.directory {
        debug!("📁 Writing log files to {}", directory.display());
    }
    Ok(guard)
}
