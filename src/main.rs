// =============================================================================
// Matrixon Telemetry - Main Entry Point
// =============================================================================
//
// Project: Matrixon - Telemetry Ingestion & Analytics
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-19
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Binary entry point. Loads configuration, installs logging and the
//   metrics exporter, then runs the telemetry service until Ctrl+C or
//   SIGTERM.
//
// =============================================================================

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Context;
use matrixon_telemetry::clap::{self, Commands};
use matrixon_telemetry::{logging, metrics, open_sink, Config, TelemetryService};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("❌ {:#}", err);
        eprintln!("matrixon-telemetry: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = clap::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply_overrides(&mut config);

    if args.command == Commands::CheckConfig {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let _log_guard = logging::init(&args.log_directive(&config), &config.logging)?;
    info!("🚀 Starting Matrixon Telemetry {}", clap::version());

    if let Some(port) = config.metrics_port {
        metrics::install_exporter(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)?;
    }

    let sink = open_sink(&config.sink)
        .await
        .with_context(|| format!("Failed to open sample sink {}", config.sink.path.display()))?;
    let (service, worker) = TelemetryService::new(config, sink);

    let address = service.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    service.run(worker, listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("❌ Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("❌ Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
}
