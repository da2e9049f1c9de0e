//! # Matrixon IoT Module - Telemetry Ingestion & Fan-out
//!
//! **Project:** Matrixon - Telemetry Ingestion & Analytics
//! **Module:** matrixon-iot - device ingestion, persistence and live fan-out
//! **Author:** arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
//! **Date:** 2024-12-19
//! **Version:** 0.11.0-alpha (Production Ready)
//! **License:** Apache 2.0 / MIT
//!
//! ## Description
//!
//! Remote sensor devices report readings over one of two wire paths:
//!
//! - **MQTT**: `devices/{credential}/data` and `devices/{credential}/status`
//! - **WebSocket**: JSON frames, optionally preceded by an identification frame
//!
//! Both adapters normalize frames into [`protocol::IngestEvent`]s and hand them
//! to the [`gateway::IngestionGateway`], which resolves the device identity,
//! queues the samples for persistence, feeds the analytics engine and fans the
//! result out to live viewers through the [`fanout::Broadcaster`].
//!
//! ## Data flow
//!
//! ```text
//! device ─┬─ broker adapter ─┐
//!         └─ socket adapter ─┴─> resolver ─> sample ─┬─> sink worker (fire-and-forget)
//!                                                    ├─> broadcaster (live delivery)
//!                                                    └─> analytics engine
//! ```

use matrixon_common::MatrixonError;
use thiserror::Error;

pub mod broker;
pub mod config;
pub mod device;
pub mod fanout;
pub mod gateway;
pub mod protocol;
pub mod sink;
pub mod socket;

pub use broker::{BrokerAdapter, BrokerClient};
pub use config::{BrokerConfig, GatewayConfig, RetryConfig, SinkConfig, SinkKind, SocketConfig, Topology};
pub use device::{DeviceIdentity, DeviceRecord, DeviceStatusStore, IdentityResolver, InMemoryDeviceRegistry, StatusUpdate};
pub use fanout::{Broadcaster, ConnectionId, DeliveryReport, DeliveryTarget, Outbox};
pub use gateway::{IngestOutcome, IngestionGateway};
pub use protocol::{ChannelValues, DataEvent, IngestEvent, OutboundMessage, SocketFrame, StatusEvent};
pub use sink::{CsvFileSink, DiscardSink, MemorySink, PersistenceSink, SinkHandle, SinkWorker};
pub use socket::{ConnectionEvent, Session, SocketState};

// =============================================================================
// Core IoT Error Types
// =============================================================================

/// IoT-specific error types
#[derive(Error, Debug)]
pub enum IoTError {
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Protocol error: {protocol} - {message}")]
    ProtocolError { protocol: String, message: String },

    #[error("Broker operation failed: {operation}")]
    BrokerOperationFailed { operation: String },

    #[error("Persistence failed: {message}")]
    Persistence { message: String },

    #[error("Identity resolver failed: {message}")]
    ResolverFailed { message: String },

    #[error("Configuration error: {parameter}")]
    ConfigurationError { parameter: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] MatrixonError),
}

impl From<serde_json::Error> for IoTError {
    fn from(err: serde_json::Error) -> Self {
        IoTError::MalformedFrame {
            reason: err.to_string(),
        }
    }
}

impl From<csv::Error> for IoTError {
    fn from(err: csv::Error) -> Self {
        IoTError::Persistence {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IoTError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IoTError::BrokerOperationFailed {
            operation: "subscribe devices/+/data".to_string(),
        };
        assert_eq!(err.to_string(), "Broker operation failed: subscribe devices/+/data");

        let err = IoTError::ConfigurationError {
            parameter: "socket.port".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: socket.port");
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{\"V0\":").unwrap_err();
        assert!(matches!(IoTError::from(json_err), IoTError::MalformedFrame { .. }));

        let common = MatrixonError::Validation("bad channel".to_string());
        assert_eq!(IoTError::from(common).to_string(), "Validation error: bad channel");

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "sensor_data.csv");
        assert!(matches!(IoTError::from(io_err), IoTError::Io(_)));
    }
}
