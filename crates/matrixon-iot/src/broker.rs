//! # Broker Adapter
//!
//! MQTT ingestion path. Subscribes to `devices/+/data` and
//! `devices/+/status` on every (re)connect and hands each publish to the
//! [`IngestionGateway`]. Reconnection is left to the rumqttc event loop:
//! after a connection error the adapter pauses for the configured delay and
//! polls again.

use std::future::Future;
use std::sync::Arc;

use matrixon_common::Credential;
use metrics::counter;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::gateway::{record_frame, IngestionGateway};
use crate::protocol::{BrokerTopic, DATA_SUBSCRIPTION, STATUS_SUBSCRIPTION};
use crate::IoTError;

/// Build client options from configuration
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

/// Cloneable publish side of the broker connection
#[derive(Clone)]
pub struct BrokerClient {
    client: AsyncClient,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient").finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Publish a JSON command to `devices/{credential}/command`
    #[instrument(level = "debug", skip(self, command), fields(credential = %credential.redacted()))]
    pub async fn send_command(&self, credential: &Credential, command: &serde_json::Value) -> Result<(), IoTError> {
        let topic = BrokerTopic::command(credential);
        let payload = serde_json::to_vec(command)?;

        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| IoTError::BrokerOperationFailed {
                operation: format!("publish {}: {}", topic, err),
            })?;
        debug!("📤 Command queued for device {}", credential.redacted());
        Ok(())
    }
}

/// Event loop driver feeding the gateway
pub struct BrokerAdapter {
    eventloop: EventLoop,
    client: AsyncClient,
    gateway: Arc<IngestionGateway>,
    config: BrokerConfig,
}

impl BrokerAdapter {
    pub fn new(config: &BrokerConfig, gateway: Arc<IngestionGateway>) -> (BrokerClient, BrokerAdapter) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), config.channel_capacity.max(1));
        (
            BrokerClient { client: client.clone() },
            BrokerAdapter {
                eventloop,
                client,
                gateway,
                config: config.clone(),
            },
        )
    }

    /// Poll until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            "🚀 Broker adapter connecting to {}:{} as {}",
            self.config.host, self.config.port, self.config.client_id
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("✅ Connected to broker {}:{}", self.config.host, self.config.port);
                        self.subscribe();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&self.gateway, &publish).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            "⚠️ Broker connection error: {}; retrying in {:?}",
                            err,
                            self.config.reconnect_delay()
                        );
                        counter!("matrixon_broker_errors_total", 1);
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                        }
                    }
                },
            }
        }

        if let Err(err) = self.client.try_disconnect() {
            debug!("🔍 Broker disconnect not sent: {}", err);
        }
        info!("🛑 Broker adapter stopped");
    }

    pub fn spawn(self, shutdown: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    // Requests go through the client channel that this same task drains, so
    // an awaiting subscribe could never complete once the channel is full.
    fn subscribe(&self) {
        for topic in [DATA_SUBSCRIPTION, STATUS_SUBSCRIPTION] {
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => debug!("📡 Subscribed to {}", topic),
                Err(err) => error!("❌ Failed to subscribe to {}: {}", topic, err),
            }
        }
    }
}

/// Hand one publish to the gateway, logging instead of failing
pub async fn dispatch(gateway: &IngestionGateway, publish: &Publish) {
    let outcome = gateway.handle_broker_message(&publish.topic, &publish.payload).await;
    record_frame("broker", &outcome);

    if let Err(err) = outcome {
        warn!("⚠️ Dropping broker message on {}: {}", publish.topic, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, SinkConfig};
    use crate::device::{DeviceIdentity, InMemoryDeviceRegistry};
    use crate::fanout::{Broadcaster, ConnectionId, Outbox};
    use crate::sink::{DiscardSink, SinkWorker};
    use matrixon_analytics::AnalyticsEngine;
    use matrixon_common::{ChannelId, DeviceId, OwnerContext, OwnerId};
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_mqtt_options_from_config() {
        let config = BrokerConfig {
            host: "broker.local".to_string(),
            port: 8883,
            client_id: "telemetry-1".to_string(),
            keep_alive_secs: 30,
            ..BrokerConfig::default()
        };
        let options = mqtt_options(&config);

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.client_id(), "telemetry-1");
    }

    async fn gateway(outbox: Arc<Outbox>) -> Arc<IngestionGateway> {
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
        let (handle, worker) = SinkWorker::new(Arc::new(DiscardSink), &SinkConfig::default());
        worker.spawn(std::future::pending());

        let broadcaster = Arc::new(Broadcaster::new(GatewayConfig::default().topology));
        broadcaster.register_viewer(Some(OwnerId(7)), ConnectionId::next(), outbox);

        Arc::new(IngestionGateway::new(
            GatewayConfig::default(),
            registry.clone(),
            registry,
            handle,
            Arc::new(AnalyticsEngine::default()),
            broadcaster,
        ))
    }

    #[tokio::test]
    async fn test_dispatch_data_publish() {
        let outbox = Arc::new(Outbox::new(8));
        let gateway = gateway(outbox.clone()).await;

        let publish = Publish::new("devices/tok123/data", QoS::AtLeastOnce, br#"{"V0":25.5,"V1":"60"}"#.to_vec());
        dispatch(&gateway, &publish).await;

        let context = OwnerContext::Owner(OwnerId(7));
        assert_eq!(gateway.analytics().channels(context).await, vec![ChannelId::new(0), ChannelId::new(1)]);
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dispatch_malformed_publish_is_logged() {
        let outbox = Arc::new(Outbox::new(8));
        let gateway = gateway(outbox.clone()).await;

        let publish = Publish::new("devices/tok123/data", QoS::AtLeastOnce, b"{\"V0\":".to_vec());
        dispatch(&gateway, &publish).await;

        assert!(outbox.is_empty());
        assert!(logs_contain("Dropping broker message on devices/tok123/data"));
    }
}
