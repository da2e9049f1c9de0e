//! # Socket Adapter
//!
//! WebSocket ingestion and live delivery. One task per connection reads
//! frames, turns each into a [`ConnectionEvent`] and applies it to the
//! connection's [`Session`]; a companion writer task drains the connection's
//! [`Outbox`]. Closing the socket unregisters it from the broadcaster before
//! anything else happens.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use matrixon_common::{Credential, DeviceStatus, OwnerId};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{SocketConfig, Topology};
use crate::device::DeviceIdentity;
use crate::fanout::{ConnectionId, Outbox};
use crate::gateway::{record_frame, IngestOutcome, IngestionGateway};
use crate::protocol::{ChannelValues, ConnectionRole, OutboundMessage, SocketFrame};
use crate::IoTError;

pub const DEVICE_WELCOME: &str = "Welcome, device";
pub const VIEWER_WELCOME: &str = "Welcome, viewer";
pub const SUBSCRIBED: &str = "Successfully subscribed to updates";

/// Shared state of the socket listener
#[derive(Clone)]
pub struct SocketState {
    gateway: Arc<IngestionGateway>,
    config: Arc<SocketConfig>,
}

impl SocketState {
    pub fn new(gateway: Arc<IngestionGateway>, config: SocketConfig) -> Self {
        Self {
            gateway,
            config: Arc::new(config),
        }
    }
}

/// Router serving the upgrade endpoint at the configured path
pub fn router(state: SocketState) -> Router {
    let path = state.config.path.clone();
    Router::new().route(&path, get(upgrade)).with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<SocketState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve `router` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), IoTError> {
    let address = listener.local_addr()?;
    info!("🌐 Socket adapter listening on {}", address);
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    info!("🛑 Socket adapter stopped");
    Ok(())
}

/// One inbound step of a connection
#[derive(Debug)]
pub enum ConnectionEvent {
    Frame(SocketFrame),
    ParseError(IoTError),
    Disconnect,
}

impl ConnectionEvent {
    fn from_message(message: Result<Message, axum::Error>, session: &Session) -> Option<Self> {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    return Some(ConnectionEvent::ParseError(IoTError::MalformedFrame {
                        reason: "binary frame is not UTF-8".to_string(),
                    }))
                }
            },
            Ok(Message::Close(_)) => return Some(ConnectionEvent::Disconnect),
            Ok(_) => return None,
            Err(err) => {
                debug!("🔍 Socket {} read error: {}", session.id, err);
                return Some(ConnectionEvent::Disconnect);
            }
        };

        Some(match SocketFrame::classify(&text, session.gateway.allowed_channels()) {
            Ok(frame) => ConnectionEvent::Frame(frame),
            Err(err) => ConnectionEvent::ParseError(err),
        })
    }
}

async fn handle_socket(socket: WebSocket, state: SocketState) {
    let mut session = Session::new(Arc::clone(&state.gateway), &state.config);
    info!("🔌 Socket {} opened", session.id);

    let (mut sink, mut stream) = socket.split();
    let outbox = Arc::clone(&session.outbox);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if sink.send(Message::Text(message.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match ConnectionEvent::from_message(message, &session) {
            Some(ConnectionEvent::Disconnect) => break,
            Some(event) => session.handle(event).await,
            None => {}
        }
    }

    session.close().await;
    if let Err(err) = writer.await {
        debug!("🔍 Socket writer ended abnormally: {}", err);
    }
}

/// Per-connection protocol state
pub struct Session {
    id: ConnectionId,
    outbox: Arc<Outbox>,
    gateway: Arc<IngestionGateway>,
    anonymous: Option<Credential>,
    role: Option<ConnectionRole>,
    credential: Option<Credential>,
    device: Option<DeviceIdentity>,
}

impl Session {
    pub fn new(gateway: Arc<IngestionGateway>, config: &SocketConfig) -> Self {
        Self {
            id: ConnectionId::next(),
            outbox: Arc::new(Outbox::new(config.outbox_capacity)),
            gateway,
            anonymous: config.anonymous_credential.clone().map(Credential::new),
            role: None,
            credential: None,
            device: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn role(&self) -> Option<ConnectionRole> {
        self.role
    }

    pub async fn handle(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(SocketFrame::IdentifyDevice { credential, readings }) => {
                self.identify(credential).await;
                if !readings.is_empty() {
                    self.data(None, readings).await;
                }
            }
            ConnectionEvent::Frame(SocketFrame::SubscribeViewer { owner }) => self.subscribe(owner),
            ConnectionEvent::Frame(SocketFrame::Data { credential, readings }) => self.data(credential, readings).await,
            ConnectionEvent::Frame(SocketFrame::Inert) => {
                debug!("🔍 Socket {} sent an unrecognized frame", self.id);
            }
            ConnectionEvent::ParseError(err) => {
                warn!("⚠️ Dropping malformed frame on socket {}: {}", self.id, err);
                record_frame("socket", &Err(err));
            }
            ConnectionEvent::Disconnect => self.close().await,
        }
    }

    async fn identify(&mut self, credential: Option<Credential>) {
        self.role = Some(ConnectionRole::Device);
        self.reply(&OutboundMessage::Connected {
            role: ConnectionRole::Device,
            message: DEVICE_WELCOME.to_string(),
        });
        self.gateway
            .broadcaster()
            .register_device(self.id, Arc::clone(&self.outbox));

        let Some(credential) = credential.or_else(|| self.anonymous.clone()) else {
            debug!("🔍 Device on socket {} identified without a credential", self.id);
            return;
        };
        self.adopt(credential).await;
        if let Some(identity) = self.device {
            self.gateway.device_presence(identity, DeviceStatus::Online).await;
        }
    }

    fn reply(&self, message: &OutboundMessage) {
        match message.to_json() {
            Ok(json) => {
                self.outbox.push(Arc::from(json));
            }
            Err(err) => warn!("⚠️ Failed to encode reply on socket {}: {}", self.id, err),
        }
    }

    fn subscribe(&mut self, owner: Option<OwnerId>) {
        let broadcaster = Arc::clone(self.gateway.broadcaster());
        if !broadcaster.register_viewer(owner, self.id, Arc::clone(&self.outbox)) {
            return;
        }
        self.role = Some(ConnectionRole::Viewer);

        match broadcaster.topology() {
            Topology::PerOwner => self.reply(&OutboundMessage::Subscribed {
                message: SUBSCRIBED.to_string(),
            }),
            Topology::SharedRoom => {
                self.reply(&OutboundMessage::Connected {
                    role: ConnectionRole::Viewer,
                    message: VIEWER_WELCOME.to_string(),
                });
                self.reply(&OutboundMessage::DeviceConnection {
                    device_connected: broadcaster.device_connected(),
                });
            }
        }
    }

    async fn data(&mut self, credential: Option<Credential>, readings: ChannelValues) {
        let credential = match credential {
            Some(credential) => {
                if self.credential.is_none() {
                    self.adopt(credential.clone()).await;
                }
                Some(credential)
            }
            None => self.credential.clone().or_else(|| self.anonymous.clone()),
        };
        let Some(credential) = credential else {
            debug!("🔍 Readings on socket {} without a credential, ignoring", self.id);
            return;
        };

        // The adopted credential was resolved once already
        let outcome = match self.device {
            Some(identity) if self.credential.as_ref() == Some(&credential) => Ok(self
                .gateway
                .handle_identified_data(identity, readings, Utc::now())
                .await),
            _ => self.gateway.handle_data(&credential, readings, Utc::now()).await,
        };
        record_frame("socket", &outcome);
        match outcome {
            Ok(IngestOutcome::UnknownCredential) => {
                debug!("🔍 Socket {} sent readings for an unknown device", self.id);
            }
            Ok(_) => {}
            Err(err) => warn!("⚠️ Failed to ingest readings on socket {}: {}", self.id, err),
        }
    }

    // Remember the credential and its identity for later frames and disconnect.
    async fn adopt(&mut self, credential: Credential) {
        match self.gateway.resolve(&credential).await {
            Ok(identity) => self.device = identity,
            Err(err) => warn!("⚠️ Could not resolve device on socket {}: {}", self.id, err),
        }
        self.credential = Some(credential);
    }

    /// Unregister first, then report the device offline
    pub async fn close(&mut self) {
        self.gateway.broadcaster().unregister(self.id);
        self.outbox.close();

        if let Some(identity) = self.device.take() {
            self.gateway.device_presence(identity, DeviceStatus::Offline).await;
        }
        info!("🔌 Socket {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, SinkConfig};
    use crate::device::{InMemoryDeviceRegistry, MockIdentityResolver};
    use crate::fanout::Broadcaster;
    use crate::sink::{DiscardSink, SinkWorker};
    use matrixon_analytics::AnalyticsEngine;
    use matrixon_common::{ChannelId, DeviceId, OwnerContext};
    use serde_json::Value;

    async fn gateway(topology: Topology) -> (Arc<IngestionGateway>, Arc<InMemoryDeviceRegistry>) {
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

        let gateway = IngestionGateway::new(
            GatewayConfig {
                topology,
                ..GatewayConfig::default()
            },
            registry.clone(),
            registry.clone(),
            handle,
            Arc::new(AnalyticsEngine::default()),
            Arc::new(Broadcaster::new(topology)),
        );
        (Arc::new(gateway), registry)
    }

    fn frame(session: &Session, text: &str) -> ConnectionEvent {
        ConnectionEvent::from_message(Ok(Message::Text(text.to_string())), session).unwrap()
    }

    fn drain(outbox: &Outbox) -> Vec<Value> {
        std::iter::from_fn(|| outbox.try_recv())
            .map(|message| serde_json::from_str(&message).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_identified_device_and_owner_viewer() {
        let (gateway, registry) = gateway(Topology::PerOwner).await;
        let config = SocketConfig::default();
        let mut viewer = Session::new(gateway.clone(), &config);
        let mut device = Session::new(gateway.clone(), &config);

        viewer.handle(frame(&viewer, r#"{"type":"subscribe","userId":7}"#)).await;
        assert_eq!(viewer.role(), Some(ConnectionRole::Viewer));
        let replies = drain(viewer.outbox());
        assert_eq!(replies[0]["type"], "subscribed");
        assert_eq!(replies[0]["message"], SUBSCRIBED);

        device.handle(frame(&device, r#"{"type":"device","deviceId":"tok123"}"#)).await;
        assert_eq!(drain(device.outbox())[0]["role"], "device");
        assert_eq!(drain(viewer.outbox())[0]["status"], "online");

        device.handle(frame(&device, r#"{"V0":24.5,"V1":60.2}"#)).await;
        let delivered = drain(viewer.outbox());
        assert_eq!(delivered[0]["type"], "sensor_data");
        assert_eq!(delivered[0]["data"]["V1"], 60.2);

        device.close().await;
        let delivered = drain(viewer.outbox());
        assert_eq!(delivered[0]["type"], "device_status");
        assert_eq!(delivered[0]["status"], "offline");
        assert_eq!(
            registry.device(DeviceId(42)).await.unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_self_identifying_data_frame() {
        let (gateway, _) = gateway(Topology::PerOwner).await;
        let mut device = Session::new(gateway.clone(), &SocketConfig::default());

        device
            .handle(frame(&device, r#"{"deviceId":"tok123","V0":24.5}"#))
            .await;
        let context = OwnerContext::Owner(OwnerId(7));
        assert_eq!(gateway.analytics().stats(context, ChannelId::new(0), None).await.count, 1);
        assert_eq!(device.role(), None);

        device.close().await;
        assert_eq!(gateway.broadcaster().viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_adopted_credential_resolves_once() {
        let identity = DeviceIdentity {
            device_id: DeviceId(42),
            owner_id: OwnerId(7),
        };
        let mut resolver = MockIdentityResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(move |_| Ok(Some(identity)));

        let (handle, worker) = SinkWorker::new(Arc::new(DiscardSink), &SinkConfig::default());
        worker.spawn(std::future::pending());
        let gateway = Arc::new(IngestionGateway::new(
            GatewayConfig::default(),
            Arc::new(resolver),
            Arc::new(InMemoryDeviceRegistry::new()),
            handle,
            Arc::new(AnalyticsEngine::default()),
            Arc::new(Broadcaster::new(Topology::PerOwner)),
        ));

        let config = SocketConfig::default();
        let mut viewer = Session::new(gateway.clone(), &config);
        viewer.handle(frame(&viewer, r#"{"type":"subscribe","userId":7}"#)).await;
        drain(viewer.outbox());

        let mut device = Session::new(gateway.clone(), &config);
        device
            .handle(frame(&device, r#"{"deviceId":"tok123","V0":24.5}"#))
            .await;
        device.handle(frame(&device, r#"{"V0":25.0}"#)).await;
        device
            .handle(frame(&device, r#"{"deviceId":"tok123","V0":25.5}"#))
            .await;

        let delivered: Vec<_> = drain(viewer.outbox())
            .into_iter()
            .filter(|message| message["type"] == "sensor_data")
            .collect();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[2]["data"]["V0"], 25.5);

        let context = OwnerContext::Owner(OwnerId(7));
        assert_eq!(gateway.analytics().stats(context, ChannelId::new(0), None).await.count, 3);
    }

    #[tokio::test]
    async fn test_anonymous_credential_and_inert_connections() {
        let (gateway, _) = gateway(Topology::PerOwner).await;
        let context = OwnerContext::Owner(OwnerId(7));
        let v0 = ChannelId::new(0);

        let mut inert = Session::new(gateway.clone(), &SocketConfig::default());
        inert.handle(frame(&inert, r#"{"V0":1.0}"#)).await;
        inert.handle(frame(&inert, r#"{"hello":"world"}"#)).await;
        assert!(gateway.analytics().channels(context).await.is_empty());

        let config = SocketConfig {
            anonymous_credential: Some("tok123".to_string()),
            ..SocketConfig::default()
        };
        let mut anonymous = Session::new(gateway.clone(), &config);
        anonymous.handle(frame(&anonymous, r#"{"V0":2.0}"#)).await;
        assert_eq!(gateway.analytics().stats(context, v0, None).await.count, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_usable() {
        let (gateway, _) = gateway(Topology::PerOwner).await;
        let mut viewer = Session::new(gateway, &SocketConfig::default());

        let event = frame(&viewer, "{not json");
        assert!(matches!(event, ConnectionEvent::ParseError(_)));
        viewer.handle(event).await;

        viewer.handle(frame(&viewer, r#"{"type":"subscribe","userId":"7"}"#)).await;
        assert_eq!(viewer.role(), Some(ConnectionRole::Viewer));
    }

    #[tokio::test]
    async fn test_shared_room_welcome_and_presence() {
        let (gateway, _) = gateway(Topology::SharedRoom).await;
        let config = SocketConfig::default();
        let mut viewer = Session::new(gateway.clone(), &config);
        let mut device = Session::new(gateway.clone(), &config);

        viewer.handle(frame(&viewer, r#"{"type":"client"}"#)).await;
        let replies = drain(viewer.outbox());
        assert_eq!(replies[0]["type"], "connected");
        assert_eq!(replies[1]["type"], "deviceStatus");
        assert_eq!(replies[1]["deviceConnected"], false);

        device.handle(frame(&device, r#"{"type":"device","deviceId":"tok123"}"#)).await;
        let replies = drain(viewer.outbox());
        assert!(replies
            .iter()
            .any(|m| m["type"] == "deviceStatus" && m["deviceConnected"] == true));

        device.close().await;
        let replies = drain(viewer.outbox());
        assert!(replies
            .iter()
            .any(|m| m["type"] == "deviceStatus" && m["deviceConnected"] == false));
        assert!(!gateway.broadcaster().device_connected());
    }

    #[tokio::test]
    async fn test_close_and_binary_messages() {
        let (gateway, _) = gateway(Topology::PerOwner).await;
        let session = Session::new(gateway, &SocketConfig::default());

        let event = ConnectionEvent::from_message(Ok(Message::Close(None)), &session);
        assert!(matches!(event, Some(ConnectionEvent::Disconnect)));

        let event = ConnectionEvent::from_message(Ok(Message::Binary(vec![0xff, 0xfe])), &session);
        assert!(matches!(event, Some(ConnectionEvent::ParseError(_))));

        let event = ConnectionEvent::from_message(Ok(Message::Ping(Vec::new())), &session);
        assert!(event.is_none());
    }
}
