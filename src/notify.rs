//! Address lifecycle notifications.
//!
//! Delivery is fire-and-forget: the engine emits events after the owning
//! transaction commits and never waits on, or fails because of, a sink.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::IpAddress;

pub const ADDRESS_CREATE: &str = "ip_block.address.create";
pub const ADDRESS_DELETE: &str = "ip_block.address.delete";

/// Payload for address events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressEvent {
    pub used_by_tenant_id: String,
    pub ip_block_id: Option<Uuid>,
    pub ip_address: String,
    pub device_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AddressEvent {
    pub fn created(addr: &IpAddress) -> Self {
        Self {
            used_by_tenant_id: addr.used_by_tenant_id.clone(),
            ip_block_id: addr.subnet_id,
            ip_address: addr.address_readable(),
            device_ids: addr.device_ids(),
            created_at: addr.created_at,
            deleted_at: None,
        }
    }

    /// Event for an address released by its last owner; `device_ids` is taken
    /// before the owner is detached
    pub fn deleted(addr: &IpAddress, deleted_at: DateTime<Utc>) -> Self {
        Self {
            deleted_at: Some(deleted_at),
            ..Self::created(addr)
        }
    }
}

/// Receiver of address lifecycle events
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, payload: &AddressEvent);
}

/// Writes events to the log as JSON
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &str, payload: &AddressEvent) {
        match serde_json::to_string(payload) {
            Ok(body) => log::info!(target: "netipam::notify", "{} {}", event, body),
            Err(e) => log::warn!(target: "netipam::notify", "Unable to encode {} payload: {}", event, e),
        }
    }
}

/// Keeps every event in memory, for tests and reports
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, AddressEvent)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, AddressEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|(name, _)| name == event).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &str, payload: &AddressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event.to_string(), payload.clone()));
        }
    }
}
