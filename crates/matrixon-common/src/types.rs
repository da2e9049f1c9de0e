//! Shared domain types
//!
//! Identifiers and the telemetry sample shape used across the ingestion,
//! analytics and fan-out layers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MatrixonError;

/// Highest virtual pin number a device may address
pub const MAX_CHANNEL_INDEX: u8 = 255;

/// Virtual data line carried by a device, written `V0`, `V1`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(u8);

impl ChannelId {
    pub const fn new(index: u8) -> Self {
        ChannelId(index)
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// The `V0..=V{last}` range
    pub fn range(last: u8) -> Vec<ChannelId> {
        (0..=last).map(ChannelId).collect()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = MatrixonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('V')
            .or_else(|| s.strip_prefix('v'))
            .ok_or_else(|| MatrixonError::Validation(format!("channel id must start with 'V': {s}")))?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MatrixonError::Validation(format!("invalid channel id: {s}")));
        }

        digits
            .parse::<u8>()
            .map(ChannelId)
            .map_err(|_| MatrixonError::Validation(format!("channel index out of range: {s}")))
    }
}

impl TryFrom<String> for ChannelId {
    type Error = MatrixonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(channel: ChannelId) -> Self {
        channel.to_string()
    }
}

/// Durable device identifier assigned by provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning user (tenant) of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-device secret carried in topics and frames
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Loggable form: first three characters, rest masked
    pub fn redacted(&self) -> String {
        let visible: String = self.0.chars().take(3).collect();
        format!("{visible}***")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}

/// Connectivity state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = MatrixonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" | "connected" => Ok(DeviceStatus::Online),
            "offline" | "disconnected" => Ok(DeviceStatus::Offline),
            other => Err(MatrixonError::Validation(format!("unknown device status: {other}"))),
        }
    }
}

/// Tenant boundary for analytics state and viewer subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerContext {
    /// Per-user isolation (multi-tenant backend)
    Owner(OwnerId),
    /// Single shared dashboard room
    Shared,
}

impl fmt::Display for OwnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerContext::Owner(owner) => write!(f, "{owner}"),
            OwnerContext::Shared => f.write_str("shared"),
        }
    }
}

impl FromStr for OwnerContext {
    type Err = MatrixonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("shared") {
            return Ok(OwnerContext::Shared);
        }
        s.parse::<i64>()
            .map(|id| OwnerContext::Owner(OwnerId(id)))
            .map_err(|_| MatrixonError::Validation(format!("invalid owner context: {s}")))
    }
}

/// One reading of one channel, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device_id: DeviceId,
    pub channel: ChannelId,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(device_id: DeviceId, channel: ChannelId, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            channel,
            value,
            timestamp,
        }
    }
}
