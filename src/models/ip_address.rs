//! Allocated IP address rows and the ports that own them.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::subnet::{ip_to_int, IpVersion};

/// A port attached to a network, identified by its own id and the device behind it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub device_id: String,
}

impl Port {
    pub fn new(id: &str, device_id: &str) -> Self {
        Self {
            id: id.to_string(),
            device_id: device_id.to_string(),
        }
    }
}

/// An IP address row, live or soft-deallocated.
///
/// Several ports may share one address (floating or shared IPs), so
/// ownership is a list rather than a single port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: Uuid,
    pub address: IpAddr,
    pub version: IpVersion,
    pub subnet_id: Option<Uuid>,
    pub network_id: String,
    pub ports: Vec<Port>,
    pub used_by_tenant_id: String,
    pub deallocated: bool,
    pub deallocated_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IpAddress {
    pub fn address_int(&self) -> u128 {
        ip_to_int(self.address)
    }

    pub fn address_readable(&self) -> String {
        self.address.to_string()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.ports.iter().map(|p| p.device_id.clone()).collect()
    }

    pub fn is_owned_by(&self, port_id: &str) -> bool {
        self.ports.iter().any(|p| p.id == port_id)
    }

    /// Attach a port, ignoring duplicates
    pub fn attach(&mut self, port: &Port) {
        if !self.is_owned_by(&port.id) {
            self.ports.push(port.clone());
        }
    }

    pub fn detach(&mut self, port_id: &str) {
        self.ports.retain(|p| p.id != port_id);
    }
}

/// Fields for a freshly drawn address
#[derive(Debug, Clone)]
pub struct NewIpAddress {
    pub address: IpAddr,
    pub subnet_id: Uuid,
    pub network_id: String,
    pub port: Port,
    pub used_by_tenant_id: String,
}
