//! # IoT Configuration
//!
//! Configuration sections for the ingestion gateway, both adapters and the
//! persistence sink. Every section deserializes with defaults so a partial
//! TOML file or a handful of `MATRIXON_*` variables is enough.

use std::path::PathBuf;
use std::time::Duration;

use matrixon_common::ChannelId;
use serde::{Deserialize, Serialize};

use crate::IoTError;

/// Fan-out topology, chosen per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One viewer connection per owner, last registration wins
    #[default]
    PerOwner,
    /// Every viewer sees every device, at most one device connection
    SharedRoom,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub topology: Topology,
    /// Channels accepted from devices; anything else is ignored
    pub allowed_channels: Vec<ChannelId>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            allowed_channels: ChannelId::range(5),
        }
    }
}

/// WebSocket listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub address: String,
    pub port: u16,
    /// Upgrade path for device and viewer connections
    pub path: String,
    /// Undelivered messages kept per connection before the oldest is dropped
    pub outbox_capacity: usize,
    /// Credential assumed for socket devices that never send one
    pub anonymous_credential: Option<String>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            path: "/ws".to_string(),
            outbox_capacity: 64,
            anonymous_credential: None,
        }
    }
}

/// MQTT broker adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Pause after a connection error before polling again
    pub reconnect_delay_ms: u64,
    /// Capacity of the client request channel
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "matrixon-telemetry".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            reconnect_delay_ms: 5000,
            channel_capacity: 64,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Retry configuration for failed persistence writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, the first one included
    pub max_attempts: u32,
    /// Initial retry delay
    pub initial_delay_ms: u64,
    /// Maximum retry delay
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), capped at `max_delay_ms`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Csv,
    Discard,
}

/// Persistence sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub path: PathBuf,
    /// Samples waiting for the sink worker before new ones are dropped
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            path: PathBuf::from("sensor_data.csv"),
            queue_capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

/// Statically provisioned device, used by the in-memory resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProvision {
    pub credential: String,
    pub device_id: i64,
    pub owner_id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), IoTError> {
        if self.allowed_channels.is_empty() {
            return Err(IoTError::ConfigurationError {
                parameter: "gateway.allowed_channels must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<(), IoTError> {
        if self.outbox_capacity == 0 {
            return Err(IoTError::ConfigurationError {
                parameter: "socket.outbox_capacity must be greater than 0".to_string(),
            });
        }
        if !self.path.starts_with('/') {
            return Err(IoTError::ConfigurationError {
                parameter: format!("socket.path must start with '/': {}", self.path),
            });
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), IoTError> {
        if self.enabled && self.host.trim().is_empty() {
            return Err(IoTError::ConfigurationError {
                parameter: "broker.host must not be empty".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(IoTError::ConfigurationError {
                parameter: "broker.channel_capacity must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), IoTError> {
        if self.queue_capacity == 0 {
            return Err(IoTError::ConfigurationError {
                parameter: "sink.queue_capacity must be greater than 0".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(IoTError::ConfigurationError {
                parameter: "sink.retry.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
