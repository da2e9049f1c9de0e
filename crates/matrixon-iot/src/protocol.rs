//! # Protocol Module
//!
//! Wire formats for both ingestion paths and the viewer-facing messages.
//!
//! ## Broker path
//!
//! Topics `devices/{credential}/{kind}` with `kind` one of `data`, `status`.
//! Data payloads are flat objects of channel to number (numeric strings are
//! tolerated); status payloads are `{"status": "online", "ip": "..."}`.
//!
//! ## Socket path
//!
//! ```json
//! {"type": "device", "deviceId": "<credential>"}
//! {"deviceId": "<credential>", "V0": 24.5, "V1": 60.2}
//! {"type": "subscribe", "userId": 7}
//! {"type": "client"}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use matrixon_analytics::{AnomalyRecord, Severity};
use matrixon_common::{ChannelId, Credential, DeviceId, DeviceStatus, OwnerId, TelemetrySample};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::IoTError;

/// Fields that may carry the device credential, in lookup order
pub const CREDENTIAL_FIELDS: [&str; 4] = ["deviceId", "token", "authToken", "auth_token"];

/// Non-channel fields that are skipped without being reported
const RESERVED_FIELDS: [&str; 5] = ["type", "name", "userId", "timestamp", "status"];

pub const DATA_SUBSCRIPTION: &str = "devices/+/data";
pub const STATUS_SUBSCRIPTION: &str = "devices/+/status";

// =============================================================================
// Channel values
// =============================================================================

/// Validated mapping from allowed channels to finite readings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelValues(BTreeMap<ChannelId, f64>);

impl ChannelValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract channel readings from a JSON object
    ///
    /// Returns the accepted readings and the keys that were rejected (unknown
    /// channel, channel outside `allowed`, non-numeric or non-finite value).
    pub fn parse(object: &Map<String, Value>, allowed: &[ChannelId]) -> (Self, Vec<String>) {
        let mut values = BTreeMap::new();
        let mut rejected = Vec::new();

        for (key, raw) in object {
            if RESERVED_FIELDS.contains(&key.as_str()) || CREDENTIAL_FIELDS.contains(&key.as_str()) {
                continue;
            }
            let channel = match key.parse::<ChannelId>() {
                Ok(channel) if allowed.contains(&channel) => channel,
                _ => {
                    rejected.push(key.clone());
                    continue;
                }
            };
            match numeric(raw) {
                Some(value) => {
                    values.insert(channel, value);
                }
                None => rejected.push(key.clone()),
            }
        }

        (Self(values), rejected)
    }

    /// Parse a broker data payload, which must be a JSON object
    pub fn from_payload(payload: &[u8], allowed: &[ChannelId]) -> Result<(Self, Vec<String>), IoTError> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(object) => Ok(Self::parse(&object, allowed)),
            other => Err(IoTError::MalformedFrame {
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    pub fn insert(&mut self, channel: ChannelId, value: f64) {
        self.0.insert(channel, value);
    }

    pub fn get(&self, channel: ChannelId) -> Option<f64> {
        self.0.get(&channel).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Readings in channel order
    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, f64)> + '_ {
        self.0.iter().map(|(channel, value)| (*channel, *value))
    }
}

impl FromIterator<(ChannelId, f64)> for ChannelValues {
    fn from_iter<I: IntoIterator<Item = (ChannelId, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn numeric(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// First non-empty credential field of a frame
pub fn credential_of(object: &Map<String, Value>) -> Option<Credential> {
    CREDENTIAL_FIELDS.iter().find_map(|field| match object.get(*field) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(Credential::new(text.trim())),
        Some(Value::Number(number)) => Some(Credential::new(number.to_string())),
        _ => None,
    })
}

// =============================================================================
// Broker topics and payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Data,
    Status,
    Other(String),
}

/// Parsed `devices/{credential}/{kind}` topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopic {
    pub credential: Credential,
    pub kind: TopicKind,
}

impl BrokerTopic {
    /// `None` for anything not shaped like a device topic
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.split('/');
        let (prefix, credential, kind) = (parts.next()?, parts.next()?, parts.next()?);
        if prefix != "devices" || credential.is_empty() || kind.is_empty() || parts.next().is_some() {
            return None;
        }

        let kind = match kind {
            "data" => TopicKind::Data,
            "status" => TopicKind::Status,
            other => TopicKind::Other(other.to_string()),
        };
        Some(Self {
            credential: Credential::new(credential),
            kind,
        })
    }

    /// Topic a device listens on for commands
    pub fn command(credential: &Credential) -> String {
        format!("devices/{}/command", credential.as_str())
    }
}

/// Broker status descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPayload {
    pub status: DeviceStatus,
    pub ip: Option<String>,
}

#[derive(Deserialize)]
struct RawStatus {
    status: String,
    #[serde(default)]
    ip: Option<String>,
}

impl StatusPayload {
    pub fn from_payload(payload: &[u8]) -> Result<Self, IoTError> {
        let raw: RawStatus = serde_json::from_slice(payload)?;
        let status = raw.status.parse::<DeviceStatus>().map_err(|err| IoTError::MalformedFrame {
            reason: err.to_string(),
        })?;
        Ok(Self {
            status,
            ip: raw.ip.filter(|ip| !ip.is_empty()),
        })
    }
}

// =============================================================================
// Socket frames
// =============================================================================

/// Classification of one inbound socket frame
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    /// Device announcing itself, possibly with readings in the same frame
    IdentifyDevice {
        credential: Option<Credential>,
        readings: ChannelValues,
    },
    /// Viewer asking for live updates
    SubscribeViewer { owner: Option<OwnerId> },
    /// Readings, optionally self-identified
    Data {
        credential: Option<Credential>,
        readings: ChannelValues,
    },
    /// Nothing recognizable
    Inert,
}

impl SocketFrame {
    /// Classify a text frame; only non-JSON or non-object frames are errors
    pub fn classify(text: &str, allowed: &[ChannelId]) -> Result<Self, IoTError> {
        let object = match serde_json::from_str::<Value>(text)? {
            Value::Object(object) => object,
            other => {
                return Err(IoTError::MalformedFrame {
                    reason: format!("expected a JSON object, got {}", json_kind(&other)),
                })
            }
        };

        let (readings, rejected) = ChannelValues::parse(&object, allowed);
        if !rejected.is_empty() {
            debug!("🔍 Ignoring unrecognized frame keys: {:?}", rejected);
        }
        let credential = credential_of(&object);

        let frame = match object.get("type").and_then(Value::as_str) {
            Some("device") => SocketFrame::IdentifyDevice { credential, readings },
            Some("subscribe") | Some("client") => SocketFrame::SubscribeViewer {
                owner: object.get("userId").and_then(owner_of),
            },
            _ if !readings.is_empty() => SocketFrame::Data { credential, readings },
            _ => SocketFrame::Inert,
        };
        Ok(frame)
    }
}

fn owner_of(raw: &Value) -> Option<OwnerId> {
    match raw {
        Value::Number(number) => number.as_i64().map(OwnerId),
        Value::String(text) => text.trim().parse::<i64>().ok().map(OwnerId),
        _ => None,
    }
}

// =============================================================================
// Normalized events
// =============================================================================

/// Readings of one resolved device
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub device_id: DeviceId,
    pub owner_id: OwnerId,
    pub readings: ChannelValues,
    pub timestamp: DateTime<Utc>,
}

impl DataEvent {
    /// One sample per reading, all sharing the event timestamp
    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.readings
            .iter()
            .map(|(channel, value)| TelemetrySample::new(self.device_id, channel, value, self.timestamp))
            .collect()
    }
}

/// Connectivity change of one resolved device
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub device_id: DeviceId,
    pub owner_id: OwnerId,
    pub status: DeviceStatus,
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Data(DataEvent),
    Status(StatusEvent),
}

// =============================================================================
// Outbound messages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Device,
    Viewer,
}

/// Server to viewer/device JSON messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "sensor_data", rename_all = "camelCase")]
    SensorData {
        device_id: DeviceId,
        data: ChannelValues,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "device_status", rename_all = "camelCase")]
    DeviceStatus { device_id: DeviceId, status: DeviceStatus },

    /// Shared-room device presence
    #[serde(rename = "deviceStatus", rename_all = "camelCase")]
    DeviceConnection { device_connected: bool },

    #[serde(rename = "subscribed")]
    Subscribed { message: String },

    #[serde(rename = "connected")]
    Connected { role: ConnectionRole, message: String },

    #[serde(rename = "anomaly", rename_all = "camelCase")]
    Anomaly {
        device_id: DeviceId,
        channel: ChannelId,
        value: f64,
        expected: f64,
        z_score: f64,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    pub fn sensor_data(event: &DataEvent) -> Self {
        OutboundMessage::SensorData {
            device_id: event.device_id,
            data: event.readings.clone(),
            timestamp: event.timestamp,
        }
    }

    pub fn anomaly(device_id: DeviceId, record: &AnomalyRecord) -> Self {
        OutboundMessage::Anomaly {
            device_id,
            channel: record.channel,
            value: record.value,
            expected: record.stats.mean,
            z_score: record.z_score,
            severity: record.severity,
            timestamp: record.timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String, IoTError> {
        Ok(serde_json::to_string(self)?)
    }
}
