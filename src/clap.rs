// =============================================================================
// Matrixon Telemetry - Clap Module
// =============================================================================
//
// Project: Matrixon - Telemetry Ingestion & Analytics
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-19
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Command line interface. Global options select the configuration file and
//   log level; `start` runs the service and `check-config` prints the
//   effective configuration.
//
// =============================================================================

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, instrument};

use crate::config::Config;

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `MATRIXON_VERSION_EXTRA` at build time to
/// include it in parenthesis after the SemVer version, e.g. a git commit hash.
///
/// # Examples
/// ```
/// use matrixon_telemetry::clap::version;
///
/// let v = version();
/// assert!(v.contains(env!("CARGO_PKG_VERSION")));
/// ```
#[instrument(level = "debug")]
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    let result = match option_env!("MATRIXON_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    };

    debug!("✅ Version string generated: {}", result);
    result
}

/// Matrixon Telemetry - sensor ingestion, live fan-out and streaming analytics
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "matrixon-telemetry")]
pub struct Args {
    /// Path to configuration file (default: `$MATRIXON_TELEMETRY_CONFIG`)
    #[clap(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter override (e.g. `debug` or `info,matrixon_iot=trace`)
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    /// Shorthand for `--log-level debug`
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the ingestion service
    Start {
        /// Bind address for the socket listener and query API
        #[clap(long)]
        address: Option<String>,

        /// Port for the socket listener and query API
        #[clap(long)]
        port: Option<u16>,

        /// Do not connect to the MQTT broker
        #[clap(long)]
        no_broker: bool,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

impl Args {
    /// Effective log filter: explicit `--log-level`, then `--verbose`, then configuration
    pub fn log_directive(&self, config: &Config) -> String {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level.clone(),
            (None, true) => "debug".to_string(),
            (None, false) => config.log.clone(),
        }
    }

    /// Fold `start` overrides into `config`
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Commands::Start {
            address,
            port,
            no_broker,
        } = &self.command
        {
            if let Some(address) = address {
                config.socket.address = address.clone();
            }
            if let Some(port) = port {
                config.socket.port = *port;
            }
            if *no_broker {
                config.broker.enabled = false;
            }
        }
    }
}

/// Parse commandline arguments into structured data
#[must_use]
pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_version() {
        assert!(version().starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_start_overrides() {
        let args = Args::try_parse_from([
            "matrixon-telemetry",
            "start",
            "--address",
            "127.0.0.1",
            "--port",
            "9000",
            "--no-broker",
        ])
        .unwrap();

        let mut config = Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.socket.address, "127.0.0.1");
        assert_eq!(config.socket.port, 9000);
        assert!(!config.broker.enabled);
    }

    #[test]
    fn test_check_config_leaves_config_alone() {
        let args = Args::try_parse_from(["matrixon-telemetry", "check-config"]).unwrap();
        assert_eq!(args.command, Commands::CheckConfig);

        let mut config = Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_log_directive_precedence() {
        let config = Config::default();

        let args = Args::try_parse_from(["matrixon-telemetry", "check-config"]).unwrap();
        assert_eq!(args.log_directive(&config), "info");

        let args = Args::try_parse_from(["matrixon-telemetry", "-v", "check-config"]).unwrap();
        assert_eq!(args.log_directive(&config), "debug");

        let args =
            Args::try_parse_from(["matrixon-telemetry", "check-config", "--log-level", "warn", "--verbose"]).unwrap();
        assert_eq!(args.log_directive(&config), "warn");
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Args::try_parse_from(["matrixon-telemetry"]).is_err());
    }
}
