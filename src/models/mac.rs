//! MAC address ranges and allocated MAC rows.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IpamError;

/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and bare `aabbccddeeff`
static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2})[:-]?([0-9A-Fa-f]{2})[:-]?([0-9A-Fa-f]{2})[:-]?([0-9A-Fa-f]{2})[:-]?([0-9A-Fa-f]{2})[:-]?([0-9A-Fa-f]{2})$")
        .expect("Invalid MAC address regex")
});

/// Largest value a 48-bit MAC address can hold
pub const MAC_MAX: u64 = (1 << 48) - 1;

/// A 48-bit MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(u64);

impl MacAddr {
    /// Build from an integer, rejecting values wider than 48 bits
    pub fn new(value: u64) -> Result<Self, IpamError> {
        if value > MAC_MAX {
            return Err(IpamError::InvalidMacAddress(format!("{:#x}", value)));
        }
        Ok(MacAddr(value))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for MacAddr {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MAC_PATTERN
            .captures(s.trim())
            .ok_or_else(|| IpamError::InvalidMacAddress(s.to_string()))?;

        let mut value = 0u64;
        for octet in caps.iter().skip(1).flatten() {
            let byte = u8::from_str_radix(octet.as_str(), 16)
                .map_err(|_| IpamError::InvalidMacAddress(s.to_string()))?;
            value = (value << 8) | u64::from(byte);
        }
        Ok(MacAddr(value))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = IpamError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// A contiguous block of MAC addresses available for allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacAddressRange {
    pub id: Uuid,
    pub first_address: u64,
    pub last_address: u64,
    /// Next candidate for fresh allocation; may sit at `last_address + 1`
    /// once the range has been walked end to end
    pub next_auto_assign_mac: u64,
    pub created_at: DateTime<Utc>,
}

impl MacAddressRange {
    pub fn new(first: MacAddr, last: MacAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_address: first.value(),
            last_address: last.value(),
            next_auto_assign_mac: first.value(),
            created_at: Utc::now(),
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.first_address && address <= self.last_address
    }

    /// Whether `occupied` rows leave no room for another address.
    ///
    /// Matches the historical `last - first <= count` rule, which keeps one
    /// slot of the range in reserve.
    pub fn is_exhausted(&self, occupied: u64) -> bool {
        self.last_address.saturating_sub(self.first_address) <= occupied
    }
}

/// A MAC address row, live or soft-deallocated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacAddress {
    pub id: Uuid,
    pub address: u64,
    pub mac_address_range_id: Uuid,
    pub tenant_id: String,
    pub deallocated: bool,
    pub deallocated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MacAddress {
    pub fn mac(&self) -> MacAddr {
        MacAddr(self.address & MAC_MAX)
    }
}
