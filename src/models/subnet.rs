//! Subnets: the address pools IPs are drawn from.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IpamError;
use crate::policy::IpPolicy;

/// IP protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const BOTH: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<IpVersion> for u8 {
    fn from(version: IpVersion) -> Self {
        match version {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(format!("Unknown IP version {}", other)),
        }
    }
}

/// Integer form of an address, as stored in pool cursors
pub fn ip_to_int(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Materialise an integer as an address of the given family.
///
/// Returns `None` when the value does not fit an IPv4 address.
pub fn int_to_ip(value: u128, version: IpVersion) -> Option<IpAddr> {
    match version {
        IpVersion::V4 => u32::try_from(value).ok().map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        IpVersion::V6 => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

/// An address pool on a network, optionally bound to one segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Uuid,
    pub network_id: String,
    pub segment_id: Option<String>,
    pub cidr: IpNet,
    pub ip_version: IpVersion,
    /// Cursor for fresh allocation; only ever moves forward
    pub next_auto_assign_ip: u128,
    pub ip_policy: Option<IpPolicy>,
    pub created_at: DateTime<Utc>,
}

impl Subnet {
    /// New subnet with its cursor at the network address
    pub fn new(network_id: &str, cidr: IpNet) -> Self {
        let cidr = cidr.trunc();
        Self {
            id: Uuid::new_v4(),
            network_id: network_id.to_string(),
            segment_id: None,
            cidr,
            ip_version: IpVersion::of(&cidr.network()),
            next_auto_assign_ip: ip_to_int(cidr.network()),
            ip_policy: None,
            created_at: Utc::now(),
        }
    }

    /// Parse `cidr` and build a subnet from it
    pub fn from_cidr(network_id: &str, cidr: &str) -> Result<Self, IpamError> {
        Ok(Self::new(network_id, cidr.trim().parse()?))
    }

    pub fn with_segment(mut self, segment_id: &str) -> Self {
        self.segment_id = Some(segment_id.to_string());
        self
    }

    pub fn with_policy(mut self, policy: IpPolicy) -> Self {
        self.ip_policy = Some(policy);
        self
    }

    pub fn with_cursor(mut self, next: IpAddr) -> Self {
        self.next_auto_assign_ip = ip_to_int(next);
        self
    }

    pub fn first_int(&self) -> u128 {
        ip_to_int(self.cidr.network())
    }

    pub fn last_int(&self) -> u128 {
        ip_to_int(self.cidr.broadcast())
    }

    /// Total number of addresses in the cidr, saturating for a /0 IPv6 block
    pub fn capacity(&self) -> u128 {
        let host_bits = u32::from(self.cidr.max_prefix_len() - self.cidr.prefix_len());
        1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.cidr.contains(addr)
    }

    pub fn contains_int(&self, value: u128) -> bool {
        value >= self.first_int() && value <= self.last_int()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_round_trip_keeps_family() {
        let v4: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(ip_to_int(v4), 0x0a00_0007);
        assert_eq!(int_to_ip(0x0a00_0007, IpVersion::V4), Some(v4));
        assert_eq!(int_to_ip(u128::from(u32::MAX) + 1, IpVersion::V4), None);

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(int_to_ip(ip_to_int(v6), IpVersion::V6), Some(v6));
    }

    #[test]
    fn test_subnet_bounds_and_capacity() {
        let subnet = Subnet::new("net", "10.0.0.0/29".parse().unwrap());
        assert_eq!(subnet.ip_version, IpVersion::V4);
        assert_eq!(subnet.capacity(), 8);
        assert_eq!(subnet.next_auto_assign_ip, subnet.first_int());
        assert!(subnet.contains(&"10.0.0.7".parse().unwrap()));
        assert!(!subnet.contains(&"10.0.0.8".parse().unwrap()));
        assert!(subnet.contains_int(subnet.last_int()));

        let v6 = Subnet::new("net", "2001:db8::/64".parse().unwrap());
        assert_eq!(v6.ip_version, IpVersion::V6);
        assert_eq!(v6.capacity(), 1u128 << 64);

        let everything = Subnet::new("net", "::/0".parse().unwrap());
        assert_eq!(everything.capacity(), u128::MAX);
    }

    #[test]
    fn test_from_cidr() {
        let subnet = Subnet::from_cidr("net", " 10.1.0.0/16 ").unwrap();
        assert_eq!(subnet.capacity(), 65536);
        assert!(matches!(
            Subnet::from_cidr("net", "10.1.0.0/33"),
            Err(IpamError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_cidr_is_truncated_to_network() {
        let subnet = Subnet::new("net", "192.168.1.77/24".parse().unwrap());
        assert_eq!(subnet.cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_version_serde_as_number() {
        assert_eq!(serde_json::to_string(&IpVersion::V6).unwrap(), "6");
        let v: IpVersion = serde_json::from_str("4").unwrap();
        assert_eq!(v, IpVersion::V4);
        assert!(serde_json::from_str::<IpVersion>("5").is_err());
    }
}
