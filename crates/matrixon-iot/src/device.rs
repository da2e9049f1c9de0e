//! # Device Identity Module
//!
//! Interfaces to the external device store plus an in-memory registry used
//! for statically provisioned deployments and tests.
//!
//! Devices are created by an external provisioning flow. This crate only
//! resolves credentials and updates `status` / `last_seen` / `ip`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matrixon_common::{Credential, DeviceId, DeviceStatus, MatrixonError, OwnerId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::config::DeviceProvision;
use crate::IoTError;

/// Who a credential belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub owner_id: OwnerId,
}

/// Maps an opaque credential to the owning identity
///
/// `Ok(None)` is the expected "unknown or rotated credential" answer; errors
/// are reserved for the store itself failing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &Credential) -> Result<Option<DeviceIdentity>, IoTError>;
}

/// Mutable device fields written by the ingestion path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub ip: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStatusStore: Send + Sync {
    async fn update_status(&self, device_id: DeviceId, update: StatusUpdate) -> Result<(), IoTError>;
}

/// Device as held by the in-memory registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub name: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub ip: Option<String>,
}

/// In-memory device table implementing both store interfaces
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    credentials: RwLock<HashMap<Credential, DeviceIdentity>>,
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration
    pub fn from_provisions(provisions: &[DeviceProvision]) -> Self {
        let mut credentials = HashMap::new();
        let mut devices = HashMap::new();

        for provision in provisions {
            let identity = DeviceIdentity {
                device_id: DeviceId(provision.device_id),
                owner_id: OwnerId(provision.owner_id),
            };
            credentials.insert(Credential::new(provision.credential.clone()), identity);
            devices.insert(identity.device_id, Self::record(identity, provision.name.clone()));
        }

        info!("✅ Device registry loaded with {} provisioned devices", devices.len());
        Self {
            credentials: RwLock::new(credentials),
            devices: RwLock::new(devices),
        }
    }

    fn record(identity: DeviceIdentity, name: Option<String>) -> DeviceRecord {
        DeviceRecord {
            identity,
            name: name.unwrap_or_else(|| format!("device-{}", identity.device_id)),
            status: DeviceStatus::Offline,
            last_seen: None,
            ip: None,
        }
    }

    /// Provision a device; an existing credential is re-pointed
    #[instrument(level = "debug", skip(self))]
    pub async fn register(&self, credential: Credential, identity: DeviceIdentity, name: Option<String>) {
        self.credentials.write().await.insert(credential, identity);
        self.devices
            .write()
            .await
            .entry(identity.device_id)
            .or_insert_with(|| Self::record(identity, name));
        debug!("🔧 Registered device {}", identity.device_id);
    }

    pub async fn device(&self, device_id: DeviceId) -> Option<DeviceRecord> {
        self.devices.read().await.get(&device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.devices.read().await.values().cloned().collect();
        devices.sort_by_key(|record| record.identity.device_id);
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for InMemoryDeviceRegistry {
    async fn resolve(&self, credential: &Credential) -> Result<Option<DeviceIdentity>, IoTError> {
        Ok(self.credentials.read().await.get(credential).copied())
    }
}

#[async_trait]
impl DeviceStatusStore for InMemoryDeviceRegistry {
    async fn update_status(&self, device_id: DeviceId, update: StatusUpdate) -> Result<(), IoTError> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(&device_id)
            .ok_or_else(|| MatrixonError::NotFound(format!("device {device_id}")))?;

        record.status = update.status;
        record.last_seen = Some(update.last_seen);
        if update.ip.is_some() {
            record.ip = update.ip;
        }
        Ok(())
    }
}
