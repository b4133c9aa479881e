//! Error types for address allocation.

use crate::models::MacAddr;
use crate::store::StoreError;

/// Result type for allocation operations
pub type Result<T> = std::result::Result<T, IpamError>;

/// Allocation engine errors
#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    // Exhaustion
    #[error("Unable to generate a MAC address on network {net_id}")]
    MacAddressGenerationFailure { net_id: String },

    #[error("Unable to generate an IP address on network {net_id}")]
    IpAddressGenerationFailure { net_id: String },

    // Lookups
    #[error("No MAC address {0} found")]
    MacAddressNotFound(MacAddr),

    // Caller input
    #[error("Bad {resource} request: {msg}")]
    BadRequest { resource: String, msg: String },

    #[error("IPAM strategy {0} is invalid")]
    InvalidStrategy(String),

    #[error("Segment ID required for network {net_id}")]
    AmbiguousNetworkId { net_id: String },

    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IpamError {
    pub(crate) fn ip_exhausted(net_id: &str) -> Self {
        IpamError::IpAddressGenerationFailure {
            net_id: net_id.to_string(),
        }
    }

    pub(crate) fn mac_exhausted(net_id: &str) -> Self {
        IpamError::MacAddressGenerationFailure {
            net_id: net_id.to_string(),
        }
    }

    pub(crate) fn bad_fixed_ips(msg: &str) -> Self {
        IpamError::BadRequest {
            resource: "fixed_ips".to_string(),
            msg: msg.to_string(),
        }
    }

    /// Whether the error reports an exhausted MAC or IP pool
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            IpamError::MacAddressGenerationFailure { .. }
                | IpamError::IpAddressGenerationFailure { .. }
        )
    }
}

impl From<ipnet::AddrParseError> for IpamError {
    fn from(e: ipnet::AddrParseError) -> Self {
        IpamError::InvalidCidr(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_messages_name_network() {
        let err = IpamError::ip_exhausted("net-a");
        assert!(err.is_exhaustion());
        assert_eq!(err.to_string(), "Unable to generate an IP address on network net-a");

        let err = IpamError::mac_exhausted("net-b");
        assert!(err.is_exhaustion());
        assert!(err.to_string().contains("net-b"));
    }

    #[test]
    fn test_store_errors_are_not_exhaustion() {
        let err: IpamError = StoreError::NoActiveTransaction.into();
        assert!(!err.is_exhaustion());
    }
}
