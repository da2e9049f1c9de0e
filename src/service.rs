// =============================================================================
// Matrixon Telemetry - Service Wiring
// =============================================================================
//
// Project: Matrixon - Telemetry Ingestion & Analytics
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-19
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Builds the shared components from configuration and runs them until a
//   shutdown signal: the socket listener and query API on one HTTP server,
//   the broker adapter, and the persistence worker. On shutdown the listener
//   stops accepting, the broker loop exits and the sink queue is drained.
//
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use matrixon_analytics::AnalyticsEngine;
use matrixon_iot::socket::{self, SocketState};
use matrixon_iot::{
    BrokerAdapter, BrokerClient, Broadcaster, CsvFileSink, DiscardSink, InMemoryDeviceRegistry, IngestionGateway,
    IoTError, PersistenceSink, SinkConfig, SinkKind, SinkWorker,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::api::{self, ApiState};
use crate::config::Config;

/// Open the configured persistence sink
#[instrument(level = "debug")]
pub async fn open_sink(config: &SinkConfig) -> Result<Arc<dyn PersistenceSink>, IoTError> {
    match config.kind {
        SinkKind::Csv => {
            let sink = CsvFileSink::open(&config.path).await?;
            info!("💾 Persisting samples to {}", sink.path().display());
            Ok(Arc::new(sink))
        }
        SinkKind::Discard => {
            info!("💾 Sample persistence disabled");
            Ok(Arc::new(DiscardSink))
        }
    }
}

/// Resolves once `stop` flips to `true` or its sender is dropped
fn stopped(mut stop: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = stop.wait_for(|stopped| *stopped).await;
    }
}

/// Every long-lived component of a running deployment
pub struct TelemetryService {
    config: Config,
    registry: Arc<InMemoryDeviceRegistry>,
    analytics: Arc<AnalyticsEngine>,
    gateway: Arc<IngestionGateway>,
    broker_client: Option<BrokerClient>,
    broker_adapter: Option<BrokerAdapter>,
}

impl std::fmt::Debug for TelemetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryService")
            .field("config", &self.config)
            .field("broker", &self.broker_client.is_some())
            .finish_non_exhaustive()
    }
}

impl TelemetryService {
    /// Wire the components; the returned worker must be handed to [`run`](Self::run)
    pub fn new(config: Config, sink: Arc<dyn PersistenceSink>) -> (Self, SinkWorker) {
        let registry = Arc::new(InMemoryDeviceRegistry::from_provisions(&config.devices));
        let analytics = Arc::new(AnalyticsEngine::new(config.analytics.clone()));
        let broadcaster = Arc::new(Broadcaster::new(config.gateway.topology));
        let (sink_handle, worker) = SinkWorker::new(sink, &config.sink);

        let gateway = Arc::new(IngestionGateway::new(
            config.gateway.clone(),
            registry.clone(),
            registry.clone(),
            sink_handle,
            analytics.clone(),
            broadcaster,
        ));

        let (broker_client, broker_adapter) = if config.broker.enabled {
            let (client, adapter) = BrokerAdapter::new(&config.broker, gateway.clone());
            (Some(client), Some(adapter))
        } else {
            info!("🔧 Broker adapter disabled");
            (None, None)
        };

        let service = Self {
            config,
            registry,
            analytics,
            gateway,
            broker_client,
            broker_adapter,
        };
        (service, worker)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InMemoryDeviceRegistry> {
        &self.registry
    }

    pub fn analytics(&self) -> &Arc<AnalyticsEngine> {
        &self.analytics
    }

    pub fn gateway(&self) -> &Arc<IngestionGateway> {
        &self.gateway
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        self.gateway.broadcaster()
    }

    /// Command publisher, present when the broker adapter is enabled
    pub fn broker_client(&self) -> Option<&BrokerClient> {
        self.broker_client.as_ref()
    }

    /// `address:port` the socket listener should bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.config.socket.address, self.config.socket.port)
    }

    /// Socket upgrade route and query API on one router
    pub fn router(&self) -> Router {
        let socket = socket::router(SocketState::new(self.gateway.clone(), self.config.socket.clone()));
        let api = api::router(ApiState {
            analytics: self.analytics.clone(),
            broadcaster: self.broadcaster().clone(),
        });

        socket
            .merge(api)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until `shutdown` resolves, then stop the broker
    /// loop and drain the persistence queue
    #[instrument(level = "debug", skip_all)]
    pub async fn run(
        mut self,
        worker: SinkWorker,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), IoTError> {
        let (stop, stop_rx) = watch::channel(false);

        let sink_task = worker.spawn(stopped(stop_rx.clone()));
        let broker_task = self
            .broker_adapter
            .take()
            .map(|adapter| adapter.spawn(stopped(stop_rx)));

        info!("🚀 Matrixon telemetry service started");
        let served = socket::serve(listener, self.router(), shutdown).await;

        let _ = stop.send(true);
        if let Some(task) = broker_task {
            if let Err(err) = task.await {
                error!("❌ Broker adapter task failed: {}", err);
            }
        }
        if let Err(err) = sink_task.await {
            error!("❌ Persistence worker task failed: {}", err);
        }

        info!("✅ Matrixon telemetry service stopped");
        served
    }
}
