//! # Fan-out Broadcaster
//!
//! Live connection table and best-effort delivery to viewers.
//!
//! Every connection owns an [`Outbox`]: a small bounded queue drained by the
//! connection's own writer task. Delivery only ever pushes into outboxes, so
//! a slow viewer never holds up ingestion or the other viewers. When an
//! outbox is full the oldest undelivered message is discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use matrixon_common::OwnerId;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Topology;
use crate::protocol::OutboundMessage;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// Bounded drop-oldest queue of serialized messages for one connection
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<Arc<str>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a message; `false` once the outbox is closed
    pub fn push(&self, message: Arc<str>) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                counter!("matrixon_outbox_overflow_total", 1);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
        true
    }

    /// Next message, waiting if the queue is empty; `None` after close
    pub async fn recv(&self) -> Option<Arc<str>> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Arc<str>> {
        self.queue.lock().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Who a delivery is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// The viewer registered for one owner
    Owner(OwnerId),
    /// Every registered viewer
    Broadcast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Closed connections dropped from the table during this delivery
    pub removed: usize,
}

#[derive(Debug, Clone)]
struct Registration {
    connection: ConnectionId,
    outbox: Arc<Outbox>,
}

#[derive(Debug, Default)]
struct ConnectionTable {
    owners: HashMap<OwnerId, Registration>,
    room: Vec<Registration>,
    device: Option<Registration>,
}

/// Connection table for one deployment topology
#[derive(Debug)]
pub struct Broadcaster {
    topology: Topology,
    table: Mutex<ConnectionTable>,
}

impl Broadcaster {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            table: Mutex::new(ConnectionTable::default()),
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Register a viewer connection
    ///
    /// Per-owner: `owner` is required and replaces any earlier viewer for it.
    /// Shared room: `owner` is ignored and the viewer joins the room.
    pub fn register_viewer(&self, owner: Option<OwnerId>, connection: ConnectionId, outbox: Arc<Outbox>) -> bool {
        let registration = Registration { connection, outbox };
        let mut table = self.table.lock();

        match self.topology {
            Topology::PerOwner => {
                let Some(owner) = owner else {
                    warn!("⚠️ Viewer {} subscribed without an owner id, ignoring", connection);
                    return false;
                };
                if let Some(previous) = table.owners.insert(owner, registration) {
                    debug!("🔧 Viewer {} replaces {} for owner {}", connection, previous.connection, owner);
                }
                info!("✅ Viewer {} subscribed for owner {}", connection, owner);
            }
            Topology::SharedRoom => {
                table.room.retain(|entry| entry.connection != connection);
                table.room.push(registration);
                info!("✅ Viewer {} joined the room ({} viewers)", connection, table.room.len());
            }
        }
        true
    }

    /// Register the room's device connection and announce it to every viewer
    pub fn register_device(&self, connection: ConnectionId, outbox: Arc<Outbox>) -> bool {
        if self.topology != Topology::SharedRoom {
            return false;
        }

        let viewers = {
            let mut table = self.table.lock();
            if let Some(previous) = table.device.replace(Registration { connection, outbox }) {
                debug!("🔧 Device connection {} replaces {}", connection, previous.connection);
            }
            table.room.clone()
        };
        info!("📡 Device connected on {}", connection);

        let message = OutboundMessage::DeviceConnection { device_connected: true };
        self.push_to(&viewers, &message);
        true
    }

    /// Remove every registration held by `connection`
    ///
    /// Returns `true` if anything was removed. Called when a connection closes,
    /// so no later delivery can target it.
    pub fn unregister(&self, connection: ConnectionId) -> bool {
        let (removed, device_left, viewers) = {
            let mut table = self.table.lock();
            let before = table.owners.len() + table.room.len();
            table.owners.retain(|_, entry| entry.connection != connection);
            table.room.retain(|entry| entry.connection != connection);
            let removed_viewers = before - (table.owners.len() + table.room.len());

            let device_left = table
                .device
                .as_ref()
                .is_some_and(|entry| entry.connection == connection);
            if device_left {
                table.device = None;
            }
            (removed_viewers > 0 || device_left, device_left, table.room.clone())
        };

        if device_left {
            info!("📴 Device disconnected from {}", connection);
            let message = OutboundMessage::DeviceConnection { device_connected: false };
            self.push_to(&viewers, &message);
        } else if removed {
            debug!("🔧 Unregistered viewer {}", connection);
        }
        removed
    }

    /// Whether the shared room currently has a device connection
    pub fn device_connected(&self) -> bool {
        self.table.lock().device.is_some()
    }

    pub fn viewer_count(&self) -> usize {
        let table = self.table.lock();
        table.owners.len() + table.room.len()
    }

    /// Deliver one message; closed connections are dropped from the table
    pub fn deliver(&self, target: DeliveryTarget, message: &OutboundMessage) -> DeliveryReport {
        let targets: Vec<Registration> = {
            let table = self.table.lock();
            match target {
                DeliveryTarget::Owner(owner) => table.owners.get(&owner).cloned().into_iter().collect(),
                DeliveryTarget::Broadcast => table.owners.values().chain(table.room.iter()).cloned().collect(),
            }
        };
        if targets.is_empty() {
            debug!("🔍 No viewer registered for {:?}", target);
            return DeliveryReport::default();
        }

        let report = self.push_to(&targets, message);
        counter!("matrixon_deliveries_total", report.delivered as u64);
        report
    }

    fn push_to(&self, targets: &[Registration], message: &OutboundMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if targets.is_empty() {
            return report;
        }

        let payload: Arc<str> = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(err) => {
                warn!("⚠️ Failed to encode outbound message: {}", err);
                return report;
            }
        };

        for target in targets {
            if target.outbox.push(Arc::clone(&payload)) {
                report.delivered += 1;
            } else {
                debug!("🔍 Connection {} already closed, removing", target.connection);
                if self.unregister(target.connection) {
                    report.removed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixon_common::{DeviceId, DeviceStatus};
    use serde_json::Value;

    fn viewer(capacity: usize) -> (ConnectionId, Arc<Outbox>) {
        (ConnectionId::next(), Arc::new(Outbox::new(capacity)))
    }

    fn status(device: i64) -> OutboundMessage {
        OutboundMessage::DeviceStatus {
            device_id: DeviceId(device),
            status: DeviceStatus::Online,
        }
    }

    fn parse(message: Arc<str>) -> Value {
        serde_json::from_str(&message).unwrap()
    }

    #[test]
    fn test_outbox_drops_oldest_on_overflow() {
        let outbox = Outbox::new(2);
        for text in ["a", "b", "c"] {
            assert!(outbox.push(Arc::from(text)));
        }
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.try_recv().as_deref(), Some("b"));
        assert_eq!(outbox.try_recv().as_deref(), Some("c"));
        assert!(outbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_outbox_recv_wakes_and_ends_on_close() {
        let outbox = Arc::new(Outbox::new(4));
        let reader = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(message) = outbox.recv().await {
                    seen.push(message.to_string());
                }
                seen
            })
        };

        outbox.push(Arc::from("hello"));
        tokio::task::yield_now().await;
        outbox.close();
        assert!(!outbox.push(Arc::from("late")));

        let seen = reader.await.unwrap();
        assert!(seen.len() <= 1);
        assert!(seen.iter().all(|m| m == "hello"));
    }

    #[test]
    fn test_per_owner_last_registration_wins() {
        let broadcaster = Broadcaster::new(Topology::PerOwner);
        let (first, first_box) = viewer(8);
        let (second, second_box) = viewer(8);

        assert!(broadcaster.register_viewer(Some(OwnerId(7)), first, first_box.clone()));
        assert!(broadcaster.register_viewer(Some(OwnerId(7)), second, second_box.clone()));

        let report = broadcaster.deliver(DeliveryTarget::Owner(OwnerId(7)), &status(42));
        assert_eq!(report.delivered, 1);
        assert!(first_box.is_empty());
        assert_eq!(parse(second_box.try_recv().unwrap())["deviceId"], 42);

        let report = broadcaster.deliver(DeliveryTarget::Owner(OwnerId(8)), &status(42));
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn test_per_owner_requires_owner_and_rejects_devices() {
        let broadcaster = Broadcaster::new(Topology::PerOwner);
        let (connection, outbox) = viewer(8);
        assert!(!broadcaster.register_viewer(None, connection, outbox.clone()));
        assert!(!broadcaster.register_device(connection, outbox));
        assert_eq!(broadcaster.viewer_count(), 0);
    }

    #[test]
    fn test_broadcast_skips_closed_connections() {
        let broadcaster = Broadcaster::new(Topology::SharedRoom);
        let viewers: Vec<_> = (0..3).map(|_| viewer(8)).collect();
        for (connection, outbox) in &viewers {
            broadcaster.register_viewer(None, *connection, outbox.clone());
        }
        viewers[1].1.close();

        let report = broadcaster.deliver(DeliveryTarget::Broadcast, &status(1));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(broadcaster.viewer_count(), 2);
        assert_eq!(viewers[0].1.len(), 1);
        assert_eq!(viewers[2].1.len(), 1);
    }

    #[test]
    fn test_shared_room_device_presence() {
        let broadcaster = Broadcaster::new(Topology::SharedRoom);
        let (viewer_id, viewer_box) = viewer(8);
        let (device_id, device_box) = viewer(8);
        broadcaster.register_viewer(None, viewer_id, viewer_box.clone());

        assert!(broadcaster.register_device(device_id, device_box));
        assert!(broadcaster.device_connected());
        let message = parse(viewer_box.try_recv().unwrap());
        assert_eq!(message["type"], "deviceStatus");
        assert_eq!(message["deviceConnected"], true);

        assert!(broadcaster.unregister(device_id));
        assert!(!broadcaster.device_connected());
        let message = parse(viewer_box.try_recv().unwrap());
        assert_eq!(message["deviceConnected"], false);

        assert!(!broadcaster.unregister(device_id));
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let broadcaster = Broadcaster::new(Topology::PerOwner);
        let (connection, outbox) = viewer(8);
        broadcaster.register_viewer(Some(OwnerId(7)), connection, outbox.clone());

        assert!(broadcaster.unregister(connection));
        let report = broadcaster.deliver(DeliveryTarget::Owner(OwnerId(7)), &status(42));
        assert_eq!(report.delivered, 0);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }
}
