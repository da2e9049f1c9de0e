//! # Matrixon Common
//!
//! **Project:** Matrixon - Telemetry Ingestion & Analytics
//! **Module:** matrixon-common - shared error and domain types
//! **Author:** arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
//! **License:** Apache 2.0 / MIT

pub mod error;
pub mod types;

pub use error::{MatrixonError, Result};
pub use types::{
    ChannelId, Credential, DeviceId, DeviceStatus, OwnerContext, OwnerId, TelemetrySample,
    MAX_CHANNEL_INDEX,
};
