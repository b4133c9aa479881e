//! Dual-stack allocation strategies.
//!
//! A strategy decides three things and nothing else: how reclamation is run,
//! whether the reclaimed set already satisfies the request, and which subnets
//! fresh addresses are drawn from. The engine owns all store access; subnet
//! selection is handed to the strategy as a callback.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{IpamError, Result};
use crate::models::{IpAddress, IpVersion, Subnet};

/// Subnet selection callback: picks one subnet, optionally of one version
pub type SelectSubnet<'a> = dyn FnMut(Option<IpVersion>) -> Result<Option<Subnet>> + 'a;

/// How the reclaim-before-create pass is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocationPlan {
    /// One pass, restricted to the requested version if there is one
    Single,
    /// One pass per listed version, all inside one shared transaction
    PerVersion(&'static [IpVersion]),
}

pub trait AllocationStrategy: Send + Sync + fmt::Debug {
    /// Registry name
    fn name(&self) -> &'static str;

    fn reallocation_plan(&self) -> ReallocationPlan;

    /// Whether reclaimed addresses alone complete the request
    fn is_satisfied(&self, reclaimed: &[IpAddress]) -> bool;

    /// Subnets to draw fresh addresses from, given what reclamation produced
    fn choose_subnets(
        &self,
        net_id: &str,
        version: Option<IpVersion>,
        reclaimed: &[IpAddress],
        select: &mut SelectSubnet<'_>,
    ) -> Result<Vec<Subnet>>;
}

fn versions_of(addresses: &[IpAddress]) -> BTreeSet<IpVersion> {
    addresses.iter().map(|a| a.version).collect()
}

/// One address of any (or the requested) version
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyStrategy;

impl AllocationStrategy for AnyStrategy {
    fn name(&self) -> &'static str {
        "ANY"
    }

    fn reallocation_plan(&self) -> ReallocationPlan {
        ReallocationPlan::Single
    }

    fn is_satisfied(&self, reclaimed: &[IpAddress]) -> bool {
        !reclaimed.is_empty()
    }

    fn choose_subnets(
        &self,
        net_id: &str,
        version: Option<IpVersion>,
        _reclaimed: &[IpAddress],
        select: &mut SelectSubnet<'_>,
    ) -> Result<Vec<Subnet>> {
        match select(version)? {
            Some(subnet) => Ok(vec![subnet]),
            None => Err(IpamError::ip_exhausted(net_id)),
        }
    }
}

/// Best-effort dual stack: one address per version where a pool allows it
#[derive(Debug, Default, Clone, Copy)]
pub struct BothStrategy;

impl AllocationStrategy for BothStrategy {
    fn name(&self) -> &'static str {
        "BOTH"
    }

    fn reallocation_plan(&self) -> ReallocationPlan {
        ReallocationPlan::PerVersion(&IpVersion::BOTH)
    }

    fn is_satisfied(&self, reclaimed: &[IpAddress]) -> bool {
        let have = versions_of(reclaimed);
        IpVersion::BOTH.iter().all(|v| have.contains(v))
    }

    fn choose_subnets(
        &self,
        net_id: &str,
        _version: Option<IpVersion>,
        reclaimed: &[IpAddress],
        select: &mut SelectSubnet<'_>,
    ) -> Result<Vec<Subnet>> {
        let have = versions_of(reclaimed);

        let mut chosen = Vec::new();
        for version in IpVersion::BOTH.iter().filter(|v| !have.contains(*v)) {
            if let Some(subnet) = select(Some(*version))? {
                chosen.push(subnet);
            }
        }

        if reclaimed.is_empty() && chosen.is_empty() {
            return Err(IpamError::ip_exhausted(net_id));
        }
        Ok(chosen)
    }
}

/// Strict dual stack: both versions or nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct BothRequiredStrategy {
    both: BothStrategy,
}

impl AllocationStrategy for BothRequiredStrategy {
    fn name(&self) -> &'static str {
        "BOTH_REQUIRED"
    }

    fn reallocation_plan(&self) -> ReallocationPlan {
        self.both.reallocation_plan()
    }

    fn is_satisfied(&self, reclaimed: &[IpAddress]) -> bool {
        self.both.is_satisfied(reclaimed)
    }

    fn choose_subnets(
        &self,
        net_id: &str,
        version: Option<IpVersion>,
        reclaimed: &[IpAddress],
        select: &mut SelectSubnet<'_>,
    ) -> Result<Vec<Subnet>> {
        let chosen = self.both.choose_subnets(net_id, version, reclaimed, select)?;
        if reclaimed.len() + chosen.len() < 2 {
            return Err(IpamError::ip_exhausted(net_id));
        }
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn v4_subnet() -> Subnet {
        Subnet::new("net", "10.0.0.0/24".parse().unwrap())
    }

    fn v6_subnet() -> Subnet {
        Subnet::new("net", "fd00::/64".parse().unwrap())
    }

    fn reclaimed(addr: &str) -> IpAddress {
        let address: std::net::IpAddr = addr.parse().unwrap();
        IpAddress {
            id: Uuid::new_v4(),
            address,
            version: IpVersion::of(&address),
            subnet_id: None,
            network_id: "net".to_string(),
            ports: Vec::new(),
            used_by_tenant_id: "t".to_string(),
            deallocated: false,
            deallocated_at: None,
            allocated_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    /// Selector backed by a fixed set of pools, recording what was asked
    fn selector<'a>(
        pools: &'a [Subnet],
        asked: &'a mut Vec<Option<IpVersion>>,
    ) -> impl FnMut(Option<IpVersion>) -> Result<Option<Subnet>> + 'a {
        move |version| {
            asked.push(version);
            Ok(pools
                .iter()
                .find(|s| version.map_or(true, |v| s.ip_version == v))
                .cloned())
        }
    }

    #[test]
    fn test_any_satisfied_by_any_reclaim() {
        let any = AnyStrategy;
        assert!(!any.is_satisfied(&[]));
        assert!(any.is_satisfied(&[reclaimed("10.0.0.1")]));
        assert_eq!(any.reallocation_plan(), ReallocationPlan::Single);
    }

    #[test]
    fn test_any_picks_requested_version() {
        let pools = [v4_subnet(), v6_subnet()];
        let mut asked = Vec::new();
        let mut select = selector(&pools, &mut asked);

        let chosen = AnyStrategy
            .choose_subnets("net", Some(IpVersion::V6), &[], &mut select)
            .unwrap();
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].ip_version, IpVersion::V6);
    }

    #[test]
    fn test_any_without_pool_is_exhaustion() {
        let mut asked = Vec::new();
        let mut select = selector(&[], &mut asked);
        let err = AnyStrategy.choose_subnets("net-x", None, &[], &mut select).unwrap_err();
        assert!(matches!(err, IpamError::IpAddressGenerationFailure { ref net_id } if net_id == "net-x"));
    }

    #[test]
    fn test_both_needs_both_versions() {
        let both = BothStrategy;
        assert!(!both.is_satisfied(&[reclaimed("10.0.0.1")]));
        assert!(!both.is_satisfied(&[reclaimed("10.0.0.1"), reclaimed("10.0.0.2")]));
        assert!(both.is_satisfied(&[reclaimed("10.0.0.1"), reclaimed("fd00::1")]));
    }

    #[test]
    fn test_both_only_selects_missing_versions() {
        let pools = [v4_subnet(), v6_subnet()];
        let mut asked = Vec::new();
        let chosen = {
            let mut select = selector(&pools, &mut asked);
            BothStrategy
                .choose_subnets("net", None, &[reclaimed("10.0.0.1")], &mut select)
                .unwrap()
        };
        assert_eq!(asked, vec![Some(IpVersion::V6)]);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].ip_version, IpVersion::V6);
    }

    #[test]
    fn test_both_tolerates_a_missing_family() {
        let pools = [v4_subnet()];
        let mut asked = Vec::new();
        let mut select = selector(&pools, &mut asked);
        let chosen = BothStrategy.choose_subnets("net", None, &[], &mut select).unwrap();
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn test_both_with_nothing_is_exhaustion() {
        let mut asked = Vec::new();
        let mut select = selector(&[], &mut asked);
        assert!(BothStrategy.choose_subnets("net", None, &[], &mut select).is_err());
    }

    #[test]
    fn test_both_required_rejects_single_family() {
        let pools = [v4_subnet()];
        let mut asked = Vec::new();
        let mut select = selector(&pools, &mut asked);
        let err = BothRequiredStrategy::default()
            .choose_subnets("net", None, &[], &mut select)
            .unwrap_err();
        assert!(err.is_exhaustion());
    }

    #[test]
    fn test_both_required_counts_reclaimed() {
        let pools = [v6_subnet()];
        let mut asked = Vec::new();
        let mut select = selector(&pools, &mut asked);
        let chosen = BothRequiredStrategy::default()
            .choose_subnets("net", None, &[reclaimed("10.0.0.9")], &mut select)
            .unwrap();
        assert_eq!(chosen.len(), 1);
    }
}
