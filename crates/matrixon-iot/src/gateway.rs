//! # Ingestion Gateway
//!
//! Adapter-independent handling of device frames. Both the broker and the
//! socket adapter end up here once a frame is parsed:
//!
//! 1. resolve the credential (unknown credentials are dropped quietly)
//! 2. queue every reading for persistence
//! 3. mark the device online
//! 4. feed the analytics engine, collecting anomalies
//! 5. deliver `sensor_data` (and any `anomaly`) to the owner's viewers

use std::sync::Arc;

use chrono::{DateTime, Utc};
use matrixon_analytics::AnalyticsEngine;
use matrixon_common::{ChannelId, Credential, DeviceId, DeviceStatus, MatrixonError, OwnerContext, OwnerId};
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::config::{GatewayConfig, Topology};
use crate::device::{DeviceIdentity, DeviceStatusStore, IdentityResolver, StatusUpdate};
use crate::fanout::{Broadcaster, DeliveryTarget};
use crate::protocol::{BrokerTopic, ChannelValues, DataEvent, IngestEvent, OutboundMessage, StatusEvent, StatusPayload, TopicKind};
use crate::sink::SinkHandle;
use crate::IoTError;

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        device_id: DeviceId,
        samples: usize,
        anomalies: usize,
    },
    StatusApplied {
        device_id: DeviceId,
        status: DeviceStatus,
    },
    UnknownCredential,
    /// No recognizable readings in the frame
    Empty,
    /// Topic kind without a handler
    Ignored,
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted { .. } => "accepted",
            IngestOutcome::StatusApplied { .. } => "status",
            IngestOutcome::UnknownCredential => "unknown_credential",
            IngestOutcome::Empty => "empty",
            IngestOutcome::Ignored => "ignored",
        }
    }
}

/// Count one frame for `adapter`, by outcome
pub fn record_frame(adapter: &'static str, outcome: &Result<IngestOutcome, IoTError>) {
    let label = match outcome {
        Ok(outcome) => outcome.label(),
        Err(IoTError::MalformedFrame { .. }) => "malformed",
        Err(_) => "failed",
    };
    counter!("matrixon_frames_total", 1, "adapter" => adapter, "outcome" => label);
}

/// Shared ingestion pipeline, one per service instance
pub struct IngestionGateway {
    config: GatewayConfig,
    resolver: Arc<dyn IdentityResolver>,
    status_store: Arc<dyn DeviceStatusStore>,
    sink: SinkHandle,
    analytics: Arc<AnalyticsEngine>,
    broadcaster: Arc<Broadcaster>,
}

impl std::fmt::Debug for IngestionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IngestionGateway {
    pub fn new(
        config: GatewayConfig,
        resolver: Arc<dyn IdentityResolver>,
        status_store: Arc<dyn DeviceStatusStore>,
        sink: SinkHandle,
        analytics: Arc<AnalyticsEngine>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            config,
            resolver,
            status_store,
            sink,
            analytics,
            broadcaster,
        }
    }

    pub fn allowed_channels(&self) -> &[ChannelId] {
        &self.config.allowed_channels
    }

    pub fn topology(&self) -> Topology {
        self.config.topology
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn analytics(&self) -> &Arc<AnalyticsEngine> {
        &self.analytics
    }

    /// Analytics partition for a device owner
    pub fn context_for(&self, owner: OwnerId) -> OwnerContext {
        match self.config.topology {
            Topology::PerOwner => OwnerContext::Owner(owner),
            Topology::SharedRoom => OwnerContext::Shared,
        }
    }

    fn target_for(&self, owner: OwnerId) -> DeliveryTarget {
        match self.config.topology {
            Topology::PerOwner => DeliveryTarget::Owner(owner),
            Topology::SharedRoom => DeliveryTarget::Broadcast,
        }
    }

    /// Look up a credential; `Ok(None)` for unknown or rotated tokens
    pub async fn resolve(&self, credential: &Credential) -> Result<Option<DeviceIdentity>, IoTError> {
        let identity = self.resolver.resolve(credential).await?;
        if identity.is_none() {
            debug!("🔍 Unknown device credential {}, dropping frame", credential.redacted());
        }
        Ok(identity)
    }

    /// Readings from a device identified by `credential`
    #[instrument(level = "debug", skip(self, readings), fields(credential = %credential.redacted()))]
    pub async fn handle_data(
        &self,
        credential: &Credential,
        readings: ChannelValues,
        timestamp: DateTime<Utc>,
    ) -> Result<IngestOutcome, IoTError> {
        if readings.is_empty() {
            return Ok(IngestOutcome::Empty);
        }
        let Some(identity) = self.resolve(credential).await? else {
            return Ok(IngestOutcome::UnknownCredential);
        };
        Ok(self.handle_identified_data(identity, readings, timestamp).await)
    }

    /// Readings from a device whose credential was already resolved
    pub async fn handle_identified_data(
        &self,
        identity: DeviceIdentity,
        readings: ChannelValues,
        timestamp: DateTime<Utc>,
    ) -> IngestOutcome {
        if readings.is_empty() {
            return IngestOutcome::Empty;
        }
        let event = DataEvent {
            device_id: identity.device_id,
            owner_id: identity.owner_id,
            readings,
            timestamp,
        };
        self.process(IngestEvent::Data(event)).await
    }

    /// Status descriptor from a device identified by `credential`
    #[instrument(level = "debug", skip(self, payload), fields(credential = %credential.redacted()))]
    pub async fn handle_status(
        &self,
        credential: &Credential,
        payload: StatusPayload,
        timestamp: DateTime<Utc>,
    ) -> Result<IngestOutcome, IoTError> {
        let Some(identity) = self.resolve(credential).await? else {
            return Ok(IngestOutcome::UnknownCredential);
        };

        let event = StatusEvent {
            device_id: identity.device_id,
            owner_id: identity.owner_id,
            status: payload.status,
            ip: payload.ip,
            timestamp,
        };
        Ok(self.process(IngestEvent::Status(event)).await)
    }

    /// Route one broker publish by topic
    pub async fn handle_broker_message(&self, topic: &str, payload: &[u8]) -> Result<IngestOutcome, IoTError> {
        let Some(topic) = BrokerTopic::parse(topic) else {
            return Err(IoTError::ProtocolError {
                protocol: "mqtt".to_string(),
                message: format!("unexpected topic {topic}"),
            });
        };
        let now = Utc::now();

        match topic.kind {
            TopicKind::Data => {
                let (readings, rejected) = ChannelValues::from_payload(payload, self.allowed_channels())?;
                if !rejected.is_empty() {
                    debug!("🔍 Ignoring unrecognized payload keys: {:?}", rejected);
                }
                self.handle_data(&topic.credential, readings, now).await
            }
            TopicKind::Status => {
                let status = StatusPayload::from_payload(payload)?;
                self.handle_status(&topic.credential, status, now).await
            }
            TopicKind::Other(kind) => {
                debug!("🔍 Ignoring topic kind '{}'", kind);
                Ok(IngestOutcome::Ignored)
            }
        }
    }

    /// Connect or disconnect of an identified socket device
    pub async fn device_presence(&self, identity: DeviceIdentity, status: DeviceStatus) -> IngestOutcome {
        let event = StatusEvent {
            device_id: identity.device_id,
            owner_id: identity.owner_id,
            status,
            ip: None,
            timestamp: Utc::now(),
        };
        self.process(IngestEvent::Status(event)).await
    }

    /// Apply a normalized event
    pub async fn process(&self, event: IngestEvent) -> IngestOutcome {
        match event {
            IngestEvent::Data(event) => self.process_data(event).await,
            IngestEvent::Status(event) => self.process_status(event).await,
        }
    }

    async fn process_data(&self, event: DataEvent) -> IngestOutcome {
        let samples = event.samples();
        for sample in &samples {
            self.sink.submit(sample.clone());
        }

        self.update_status(event.device_id, DeviceStatus::Online, None, event.timestamp)
            .await;

        let context = self.context_for(event.owner_id);
        let mut anomalies = Vec::new();
        for (channel, value) in event.readings.iter() {
            if let Some(record) = self.analytics.ingest(context, channel, value, event.timestamp).await {
                anomalies.push(record);
            }
        }

        let target = self.target_for(event.owner_id);
        self.broadcaster.deliver(target, &OutboundMessage::sensor_data(&event));
        for record in &anomalies {
            self.broadcaster
                .deliver(target, &OutboundMessage::anomaly(event.device_id, record));
        }

        debug!(
            "📊 Device {} reported {} readings ({} anomalies)",
            event.device_id,
            samples.len(),
            anomalies.len()
        );
        IngestOutcome::Accepted {
            device_id: event.device_id,
            samples: samples.len(),
            anomalies: anomalies.len(),
        }
    }

    async fn process_status(&self, event: StatusEvent) -> IngestOutcome {
        self.update_status(event.device_id, event.status, event.ip.clone(), event.timestamp)
            .await;

        let message = OutboundMessage::DeviceStatus {
            device_id: event.device_id,
            status: event.status,
        };
        self.broadcaster.deliver(self.target_for(event.owner_id), &message);

        debug!("📡 Device {} is now {}", event.device_id, event.status);
        IngestOutcome::StatusApplied {
            device_id: event.device_id,
            status: event.status,
        }
    }

    async fn update_status(&self, device_id: DeviceId, status: DeviceStatus, ip: Option<String>, last_seen: DateTime<Utc>) {
        let update = StatusUpdate { status, last_seen, ip };
        match self.status_store.update_status(device_id, update).await {
            Ok(()) => {}
            Err(IoTError::Common(MatrixonError::NotFound(what))) => {
                debug!("🔍 Status update skipped, {} not in store", what);
            }
            Err(err) => warn!("⚠️ Failed to update status of device {}: {}", device_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::device::{InMemoryDeviceRegistry, MockIdentityResolver};
    use crate::fanout::{ConnectionId, Outbox};
    use crate::sink::{MemorySink, SinkWorker};
    use matrixon_analytics::AnalyticsConfig;
    use serde_json::Value;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const V0: ChannelId = ChannelId::new(0);
    const V1: ChannelId = ChannelId::new(1);

    struct Harness {
        gateway: IngestionGateway,
        registry: Arc<InMemoryDeviceRegistry>,
        memory: Arc<MemorySink>,
        viewer: Arc<Outbox>,
        stop: oneshot::Sender<()>,
        worker: JoinHandle<()>,
    }

    impl Harness {
        async fn new(topology: Topology) -> Self {
            let registry = Arc::new(InMemoryDeviceRegistry::new());
            registry
                .register(
                    Credential::new("tok123"),
                    DeviceIdentity {
                        device_id: DeviceId(42),
                        owner_id: OwnerId(7),
                    },
                    None,
                )
                .await;
            Self::with_resolver(topology, registry.clone(), registry).await
        }

        async fn with_resolver(
            topology: Topology,
            resolver: Arc<dyn IdentityResolver>,
            registry: Arc<InMemoryDeviceRegistry>,
        ) -> Self {
            let memory = Arc::new(MemorySink::new());
            let (handle, worker) = SinkWorker::new(memory.clone(), &SinkConfig::default());
            let (stop, stopped) = oneshot::channel::<()>();
            let worker = worker.spawn(async move {
                let _ = stopped.await;
            });

            let broadcaster = Arc::new(Broadcaster::new(topology));
            let viewer = Arc::new(Outbox::new(16));
            broadcaster.register_viewer(Some(OwnerId(7)), ConnectionId::next(), viewer.clone());

            let gateway = IngestionGateway::new(
                GatewayConfig {
                    topology,
                    ..GatewayConfig::default()
                },
                resolver,
                registry.clone(),
                handle,
                Arc::new(AnalyticsEngine::new(AnalyticsConfig::default())),
                broadcaster,
            );
            Self {
                gateway,
                registry,
                memory,
                viewer,
                stop,
                worker,
            }
        }

        async fn drain_sink(self) -> Arc<MemorySink> {
            let _ = self.stop.send(());
            self.worker.await.unwrap();
            self.memory
        }
    }

    fn readings(values: &[(ChannelId, f64)]) -> ChannelValues {
        values.iter().copied().collect()
    }

    fn next_message(outbox: &Outbox) -> Value {
        serde_json::from_str(&outbox.try_recv().expect("no message delivered")).unwrap()
    }

    #[tokio::test]
    async fn test_data_frame_end_to_end() {
        let harness = Harness::new(Topology::PerOwner).await;
        let now = Utc::now();

        let outcome = harness
            .gateway
            .handle_data(&Credential::new("tok123"), readings(&[(V0, 24.5), (V1, 60.2)]), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                device_id: DeviceId(42),
                samples: 2,
                anomalies: 0
            }
        );

        let message = next_message(&harness.viewer);
        assert_eq!(message["type"], "sensor_data");
        assert_eq!(message["deviceId"], 42);
        assert_eq!(message["data"]["V0"], 24.5);
        assert_eq!(message["data"]["V1"], 60.2);

        let record = harness.registry.device(DeviceId(42)).await.unwrap();
        assert_eq!(record.status, DeviceStatus::Online);
        assert_eq!(record.last_seen, Some(now));

        let context = OwnerContext::Owner(OwnerId(7));
        assert_eq!(harness.gateway.analytics().stats(context, V0, None).await.count, 1);

        let memory = harness.drain_sink().await;
        let samples = memory.samples();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().any(|s| s.channel == V0 && s.value == 24.5 && s.device_id == DeviceId(42)));
        assert!(samples.iter().any(|s| s.channel == V1 && s.value == 60.2 && s.timestamp == now));
    }

    #[tokio::test]
    async fn test_unknown_credential_has_no_effect() {
        let harness = Harness::new(Topology::PerOwner).await;

        let outcome = harness
            .gateway
            .handle_data(&Credential::new("rotated"), readings(&[(V0, 1.0)]), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::UnknownCredential);
        assert!(harness.viewer.is_empty());
        assert_eq!(
            harness.registry.device(DeviceId(42)).await.unwrap().status,
            DeviceStatus::Offline
        );
        assert!(harness.drain_sink().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolver_failure_propagates() {
        let mut resolver = MockIdentityResolver::new();
        resolver.expect_resolve().returning(|_| {
            Err(IoTError::ResolverFailed {
                message: "store unavailable".to_string(),
            })
        });
        let harness = Harness::with_resolver(
            Topology::PerOwner,
            Arc::new(resolver),
            Arc::new(InMemoryDeviceRegistry::new()),
        )
        .await;

        let result = harness
            .gateway
            .handle_data(&Credential::new("tok123"), readings(&[(V0, 1.0)]), Utc::now())
            .await;
        assert!(matches!(result, Err(IoTError::ResolverFailed { .. })));
        assert!(harness.viewer.is_empty());
    }

    #[tokio::test]
    async fn test_empty_readings_skip_resolution() {
        let mut resolver = MockIdentityResolver::new();
        resolver.expect_resolve().never();
        let harness = Harness::with_resolver(
            Topology::PerOwner,
            Arc::new(resolver),
            Arc::new(InMemoryDeviceRegistry::new()),
        )
        .await;

        let outcome = harness
            .gateway
            .handle_data(&Credential::new("tok123"), ChannelValues::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Empty);
    }

    #[tokio::test]
    async fn test_broker_topics() {
        let harness = Harness::new(Topology::PerOwner).await;
        let gateway = &harness.gateway;

        let outcome = gateway
            .handle_broker_message("devices/tok123/data", br#"{"V0":"25.5","V7":1}"#)
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { samples: 1, .. }));
        assert_eq!(next_message(&harness.viewer)["data"]["V0"], 25.5);

        let outcome = gateway
            .handle_broker_message("devices/tok123/status", br#"{"status":"online","ip":"10.0.0.9"}"#)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::StatusApplied {
                device_id: DeviceId(42),
                status: DeviceStatus::Online
            }
        );
        let message = next_message(&harness.viewer);
        assert_eq!(message["type"], "device_status");
        assert_eq!(message["status"], "online");
        assert_eq!(
            harness.registry.device(DeviceId(42)).await.unwrap().ip.as_deref(),
            Some("10.0.0.9")
        );

        let outcome = gateway.handle_broker_message("devices/tok123/firmware", b"{}").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);

        assert!(matches!(
            gateway.handle_broker_message("devices/tok123/data", b"{oops").await,
            Err(IoTError::MalformedFrame { .. })
        ));
        assert!(matches!(
            gateway.handle_broker_message("weather/today", b"{}").await,
            Err(IoTError::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn test_anomaly_is_delivered() {
        let harness = Harness::new(Topology::PerOwner).await;
        let credential = Credential::new("tok123");
        let start = Utc::now();

        for (i, value) in [10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 10.0, 12.0].iter().enumerate() {
            let at = start + chrono::Duration::seconds(i as i64);
            harness
                .gateway
                .handle_data(&credential, readings(&[(V0, *value)]), at)
                .await
                .unwrap();
        }
        while harness.viewer.try_recv().is_some() {}

        let outcome = harness
            .gateway
            .handle_data(&credential, readings(&[(V0, 15.0)]), start + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { anomalies: 1, .. }));

        assert_eq!(next_message(&harness.viewer)["type"], "sensor_data");
        let anomaly = next_message(&harness.viewer);
        assert_eq!(anomaly["type"], "anomaly");
        assert_eq!(anomaly["channel"], "V0");
        assert_eq!(anomaly["severity"], "critical");
        assert_eq!(anomaly["expected"], 11.0);
    }

    #[tokio::test]
    async fn test_shared_room_broadcasts_and_device_disconnect() {
        let harness = Harness::new(Topology::SharedRoom).await;
        let identity = DeviceIdentity {
            device_id: DeviceId(42),
            owner_id: OwnerId(7),
        };

        harness
            .gateway
            .handle_data(&Credential::new("tok123"), readings(&[(V0, 1.0)]), Utc::now())
            .await
            .unwrap();
        assert_eq!(next_message(&harness.viewer)["type"], "sensor_data");
        assert_eq!(
            harness.gateway.analytics().channels(OwnerContext::Shared).await,
            vec![V0]
        );

        let outcome = harness.gateway.device_presence(identity, DeviceStatus::Offline).await;
        assert!(matches!(outcome, IngestOutcome::StatusApplied { status: DeviceStatus::Offline, .. }));
        assert_eq!(next_message(&harness.viewer)["status"], "offline");
        assert_eq!(
            harness.registry.device(DeviceId(42)).await.unwrap().status,
            DeviceStatus::Offline
        );
    }
}
