//! Port lifecycle on top of the allocation engine.
//!
//! A port gets its IP addresses first and its MAC address last, all inside
//! one transaction scope: if any step fails, nothing created for the port
//! survives. Releasing a port frees the MAC first, then every IP it owns.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IpamError, Result};
use crate::ipam::{IpRequest, Ipam, StrategyRegistry};
use crate::models::{IpAddress, MacAddr, MacAddress, Port};
use crate::store::{AddressStore, IpAddressFilter, LockMode, Scope, Session, StoreTransaction};

/// A network as far as address allocation is concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    /// Strategy name; unknown or missing names use the registry default
    #[serde(default)]
    pub ipam_strategy: Option<String>,
    /// Shared networks are split into segments and need a segment id
    #[serde(default)]
    pub shared: bool,
}

impl Network {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ipam_strategy: None,
            shared: false,
        }
    }

    fn engine<'r>(&self, registry: &'r StrategyRegistry) -> &'r Ipam {
        match &self.ipam_strategy {
            Some(name) => registry.resolve(name),
            None => registry.default_engine(),
        }
    }
}

/// One `fixed_ips` entry of a port request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: Option<Uuid>,
    pub ip_address: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOp {
    Create,
    Update,
}

/// Check `fixed_ips` entries before anything is allocated for them.
///
/// On create every entry must name both a subnet and an address. On update
/// an entry may name just a subnet, but an address always needs its subnet.
pub fn validate_fixed_ips(fixed_ips: &[FixedIp], op: PortOp) -> Result<()> {
    for fixed_ip in fixed_ips {
        match (op, fixed_ip.subnet_id, fixed_ip.ip_address) {
            (PortOp::Create, Some(_), Some(_)) => {}
            (PortOp::Create, _, _) => {
                return Err(IpamError::bad_fixed_ips("subnet_id and ip_address required"));
            }
            (PortOp::Update, None, None) => {
                return Err(IpamError::bad_fixed_ips("subnet_id or ip_address required"));
            }
            (PortOp::Update, None, Some(_)) => {
                return Err(IpamError::bad_fixed_ips(
                    "subnet_id required for ip_address allocation",
                ));
            }
            (PortOp::Update, Some(_), _) => {}
        }
    }
    Ok(())
}

/// What the caller asks for when creating a port
#[derive(Debug, Clone, Default)]
pub struct PortRequest {
    pub device_id: String,
    pub mac_address: Option<MacAddr>,
    pub segment_id: Option<String>,
    pub fixed_ips: Vec<FixedIp>,
}

impl PortRequest {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Default::default()
        }
    }
}

/// Addresses handed to a new port
#[derive(Debug, Clone)]
pub struct PortAllocation {
    pub port: Port,
    pub mac: MacAddress,
    pub ips: Vec<IpAddress>,
}

/// Create a port on `network` and give it its addresses.
pub fn provision_port<S: AddressStore>(
    registry: &StrategyRegistry,
    session: &mut Session<'_, S>,
    network: &Network,
    request: &PortRequest,
    reuse_after: Duration,
) -> Result<PortAllocation> {
    validate_fixed_ips(&request.fixed_ips, PortOp::Create)?;

    let segment_id = if network.shared {
        match &request.segment_id {
            Some(segment) => Some(segment.as_str()),
            None => {
                return Err(IpamError::AmbiguousNetworkId {
                    net_id: network.id.clone(),
                })
            }
        }
    } else {
        None
    };

    let ipam = network.engine(registry);
    let port = Port::new(&Uuid::new_v4().to_string(), &request.device_id);
    log::info!(
        "Provisioning port {} on network {} for tenant {}",
        port.id,
        network.id,
        session.tenant_id()
    );

    session.transaction(|s| -> Result<PortAllocation> {
        let mut base = IpRequest::new(&network.id, port.clone(), reuse_after);
        base.segment_id = segment_id.map(str::to_string);

        let mut ips = Vec::new();
        if request.fixed_ips.is_empty() {
            ips.extend(ipam.allocate_ip(s, &base)?);
        } else {
            for fixed_ip in &request.fixed_ips {
                let mut ip_request = base.clone();
                ip_request.address = fixed_ip.ip_address;
                ips.extend(ipam.allocate_ip(s, &ip_request)?);
            }
        }

        let mac = ipam.allocate_mac(s, &network.id, &port.id, reuse_after, request.mac_address)?;
        Ok(PortAllocation {
            port: port.clone(),
            mac,
            ips,
        })
    })
}

/// Reconcile a port's addresses with a new `fixed_ips` list.
///
/// Entries with an address are allocated from their subnet unless the port
/// already holds that address; addresses the port holds but the list no
/// longer names are released; subnet-only entries get one more address from
/// that subnet. Returns the addresses allocated by this call.
pub fn update_fixed_ips<S: AddressStore>(
    registry: &StrategyRegistry,
    session: &mut Session<'_, S>,
    network: &Network,
    port: &Port,
    fixed_ips: &[FixedIp],
    reuse_after: Duration,
) -> Result<Vec<IpAddress>> {
    validate_fixed_ips(fixed_ips, PortOp::Update)?;

    // Fixed IP changes always target explicit subnets
    let ipam = registry.resolve("ANY");

    session.transaction(|s| -> Result<Vec<IpAddress>> {
        let filter = IpAddressFilter {
            port_id: Some(port.id.clone()),
            ..Default::default()
        };
        let held: BTreeSet<IpAddr> = s
            .tx()?
            .find_ip_addresses(&filter, LockMode::Update, Scope::All, None)?
            .into_iter()
            .filter(|row| !row.deallocated)
            .map(|row| row.address)
            .collect();

        let wanted: BTreeSet<IpAddr> = fixed_ips.iter().filter_map(|f| f.ip_address).collect();

        let mut allocated = Vec::new();
        for fixed_ip in fixed_ips {
            let (Some(subnet_id), Some(address)) = (fixed_ip.subnet_id, fixed_ip.ip_address) else {
                continue;
            };
            if held.contains(&address) {
                continue;
            }
            let request = IpRequest::new(&network.id, port.clone(), reuse_after)
                .with_address(address)
                .with_subnets(vec![subnet_id]);
            allocated.extend(ipam.allocate_ip(s, &request)?);
        }

        for address in held.difference(&wanted) {
            ipam.deallocate_ip(s, port, Some(*address))?;
        }

        for fixed_ip in fixed_ips.iter().filter(|f| f.ip_address.is_none()) {
            if let Some(subnet_id) = fixed_ip.subnet_id {
                let request = IpRequest::new(&network.id, port.clone(), reuse_after)
                    .with_subnets(vec![subnet_id]);
                allocated.extend(ipam.allocate_ip(s, &request)?);
            }
        }

        Ok(allocated)
    })
}

/// Release a port's MAC and every IP it owns.
pub fn release_port<S: AddressStore>(
    registry: &StrategyRegistry,
    session: &mut Session<'_, S>,
    network: &Network,
    port: &Port,
    mac: MacAddr,
) -> Result<Vec<IpAddress>> {
    let ipam = network.engine(registry);
    log::info!("Releasing port {} on network {}", port.id, network.id);

    session.transaction(|s| -> Result<Vec<IpAddress>> {
        ipam.deallocate_mac(s, mac)?;
        ipam.deallocate_ip(s, port, None)
    })
}
