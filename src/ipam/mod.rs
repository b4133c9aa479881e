//! The allocation engine.
//!
//! [`Ipam`] hands out MAC and IP addresses from the pools kept in an
//! [`AddressStore`](crate::store::AddressStore). It is stateless between
//! calls: every decision re-reads pool occupancy inside the transaction that
//! acts on it, so nothing is cached across requests.
//!
//! Each engine instance is bound to one [`AllocationStrategy`], which governs
//! dual-stack behaviour:
//!
//! - `ANY`: one address, of the requested version if one was given
//! - `BOTH`: one address per IP version where a pool has room
//! - `BOTH_REQUIRED`: one address per IP version, or a failure
//!
//! ## Allocation order
//!
//! 1. **Reclaim**: a released address whose reuse-after window has elapsed
//!    is recycled first, lowest address first. Rows found outside their
//!    subnet's cidr are purged and the search retried, at most three times.
//! 2. **Fresh draw**: if the strategy is not yet satisfied, it chooses
//!    subnets with spare capacity and the engine walks each subnet's cursor
//!    forward, skipping IP-policy exclusions and addresses already in use.
//!
//! Engines are obtained from a [`StrategyRegistry`] rather than built
//! directly by callers.

mod ip;
mod mac;
pub mod registry;
pub mod strategy;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{IpVersion, Port};
use crate::notify::Notifier;

pub use registry::StrategyRegistry;
pub use strategy::{
    AllocationStrategy, AnyStrategy, BothRequiredStrategy, BothStrategy, ReallocationPlan,
};

/// Reclamation gives up after this many corrupt rows in one call
pub const REALLOCATE_ATTEMPTS: usize = 3;

/// Parameters of one IP allocation request
#[derive(Debug, Clone)]
pub struct IpRequest {
    pub network_id: String,
    pub port: Port,
    pub reuse_after: Duration,
    pub version: Option<IpVersion>,
    /// Specific address asked for by the caller
    pub address: Option<IpAddr>,
    /// Segment of a shared network
    pub segment_id: Option<String>,
    /// Restrict allocation to these subnets
    pub subnet_ids: Option<Vec<Uuid>>,
}

impl IpRequest {
    pub fn new(network_id: &str, port: Port, reuse_after: Duration) -> Self {
        Self {
            network_id: network_id.to_string(),
            port,
            reuse_after,
            version: None,
            address: None,
            segment_id: None,
            subnet_ids: None,
        }
    }

    pub fn with_version(mut self, version: IpVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_segment(mut self, segment_id: &str) -> Self {
        self.segment_id = Some(segment_id.to_string());
        self
    }

    pub fn with_subnets(mut self, subnet_ids: Vec<Uuid>) -> Self {
        self.subnet_ids = Some(subnet_ids);
        self
    }
}

/// Allocation engine bound to one strategy
#[derive(Clone)]
pub struct Ipam {
    strategy: Arc<dyn AllocationStrategy>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for Ipam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ipam")
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

impl Ipam {
    pub fn new(strategy: Arc<dyn AllocationStrategy>, notifier: Arc<dyn Notifier>) -> Self {
        Self { strategy, notifier }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

/// Newest `deallocated_at` still eligible for reuse
pub(crate) fn reuse_cutoff(reuse_after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(reuse_after)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_cutoff() {
        let before = Utc::now();
        let cutoff = reuse_cutoff(Duration::from_secs(60));
        assert!(cutoff <= before - chrono::Duration::seconds(59));

        // Absurd windows clamp instead of overflowing
        assert_eq!(reuse_cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_request_builder() {
        let request = IpRequest::new("net", Port::new("p", "d"), Duration::ZERO)
            .with_version(IpVersion::V6)
            .with_segment("seg-1");
        assert_eq!(request.version, Some(IpVersion::V6));
        assert_eq!(request.segment_id.as_deref(), Some("seg-1"));
        assert!(request.address.is_none());
        assert!(request.subnet_ids.is_none());
    }
}
