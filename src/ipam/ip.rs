//! IP address reclamation, subnet selection and allocation.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;

use super::{reuse_cutoff, IpRequest, Ipam, ReallocationPlan, REALLOCATE_ATTEMPTS};
use crate::error::{IpamError, Result};
use crate::models::{int_to_ip, IpAddress, IpVersion, NewIpAddress, Port, Subnet};
use crate::notify::{AddressEvent, ADDRESS_CREATE, ADDRESS_DELETE};
use crate::policy::exclusion_ranges;
use crate::store::{
    AddressStore, IpAddressFilter, LockMode, OrderBy, Scope, Session, StoreTransaction,
    SubnetFilter,
};

/// Outcome of one reclamation attempt
enum Reclaim {
    Found(IpAddress),
    /// A corrupt candidate was purged; look again
    Retry,
    Done,
}

impl Ipam {
    /// Allocate addresses for `request.port` according to the engine's strategy.
    ///
    /// Reclamation and the fresh draw run under one transaction scope, so a
    /// strategy failure also rolls back anything reclaimed on the way.
    /// Creation events go out once the outermost scope has committed, for new
    /// rows only.
    pub fn allocate_ip<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        request: &IpRequest,
    ) -> Result<Vec<IpAddress>> {
        let (reclaimed, created) = session.transaction(|s| -> Result<_> {
            let reclaimed = self.reallocate(s, request)?;
            if self.strategy.is_satisfied(&reclaimed) {
                log::debug!(
                    "Port {} satisfied by {} reclaimed address(es)",
                    request.port.id,
                    reclaimed.len()
                );
                return Ok((reclaimed, Vec::new()));
            }

            let subnets = match request.subnet_ids {
                Some(_) => match self.select_subnet(s, request, None)? {
                    Some(subnet) => vec![subnet],
                    None => return Err(IpamError::ip_exhausted(&request.network_id)),
                },
                None => self.strategy.choose_subnets(
                    &request.network_id,
                    request.version,
                    &reclaimed,
                    &mut |version: Option<IpVersion>| self.select_subnet(s, request, version),
                )?,
            };

            let created = self.allocate_from_subnets(s, request, subnets)?;
            for row in &created {
                self.notify_after_commit(s, ADDRESS_CREATE, AddressEvent::created(row));
            }
            Ok((reclaimed, created))
        })?;

        let mut addresses = reclaimed;
        addresses.extend(created);
        Ok(addresses)
    }

    fn reallocate<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        request: &IpRequest,
    ) -> Result<Vec<IpAddress>> {
        match self.strategy.reallocation_plan() {
            ReallocationPlan::Single => self.reallocate_ip(session, request, request.version),
            ReallocationPlan::PerVersion(versions) => {
                session.transaction(|s| -> Result<Vec<IpAddress>> {
                    let mut reclaimed = Vec::new();
                    for version in versions {
                        reclaimed.extend(self.reallocate_ip(s, request, Some(*version))?);
                    }
                    Ok(reclaimed)
                })
            }
        }
    }

    /// Recycle one released address whose reuse-after window has elapsed.
    ///
    /// Candidates are taken lowest address first. A candidate that no longer
    /// lies inside its subnet is deleted and the search repeated, up to
    /// [`REALLOCATE_ATTEMPTS`] times. A candidate whose subnet is missing ends
    /// the search. Either way the result is simply empty.
    pub fn reallocate_ip<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        request: &IpRequest,
        version: Option<IpVersion>,
    ) -> Result<Vec<IpAddress>> {
        let net_id = request.network_id.as_str();
        let cutoff = reuse_cutoff(request.reuse_after);
        let versions = version.map_or_else(|| IpVersion::BOTH.to_vec(), |v| vec![v]);

        for attempt in 1..=REALLOCATE_ATTEMPTS {
            let outcome = session.transaction(|s| -> Result<Reclaim> {
                let tenant = s.tenant_id().to_string();
                let tx = s.tx()?;

                let subnet_ids = match (&request.subnet_ids, &request.segment_id) {
                    (Some(ids), _) => Some(ids.clone()),
                    (None, Some(segment)) => {
                        let filter = SubnetFilter {
                            network_id: Some(net_id.to_string()),
                            segment_id: Some(segment.clone()),
                            ..Default::default()
                        };
                        let ids: Vec<_> = tx
                            .find_subnets(&filter, LockMode::None)?
                            .into_iter()
                            .map(|(subnet, _)| subnet.id)
                            .collect();
                        if ids.is_empty() {
                            return Err(IpamError::ip_exhausted(net_id));
                        }
                        Some(ids)
                    }
                    (None, None) => None,
                };

                let filter = IpAddressFilter {
                    network_id: Some(net_id.to_string()),
                    address: request.address,
                    deallocated: Some(true),
                    deallocated_before: Some(cutoff),
                    subnet_ids,
                    versions: Some(versions.clone()),
                    ..Default::default()
                };
                let Some(mut row) =
                    tx.find_ip_address(&filter, LockMode::Update, Some(OrderBy::Address))?
                else {
                    return Ok(Reclaim::Done);
                };

                let Some(subnet_id) = row.subnet_id else {
                    return Ok(Reclaim::Done);
                };
                let Some((subnet, _)) = tx
                    .find_subnets(&SubnetFilter::by_id(subnet_id), LockMode::None)?
                    .into_iter()
                    .next()
                else {
                    return Ok(Reclaim::Done);
                };

                if !subnet.contains(&row.address) {
                    log::warn!(
                        "Address {} lies outside subnet {} ({}), deleting it (attempt {})",
                        row.address,
                        subnet.id,
                        subnet.cidr,
                        attempt
                    );
                    tx.delete_ip_address(row.id)?;
                    return Ok(Reclaim::Retry);
                }

                row.deallocated = false;
                row.deallocated_at = None;
                row.allocated_at = Some(Utc::now());
                row.used_by_tenant_id = tenant;
                row.attach(&request.port);
                Ok(Reclaim::Found(tx.update_ip_address(&row)?))
            })?;

            match outcome {
                Reclaim::Found(row) => {
                    log::debug!("Reclaimed {} for port {}", row.address, request.port.id);
                    return Ok(vec![row]);
                }
                Reclaim::Retry => continue,
                Reclaim::Done => break,
            }
        }

        Ok(Vec::new())
    }

    /// Pick the first subnet on the network with room for one more address.
    ///
    /// Occupancy counts every row, released ones included. Policy exclusions
    /// count against capacity unless a specific address was requested, in
    /// which case only subnets containing it are considered.
    pub fn select_subnet<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        request: &IpRequest,
        version: Option<IpVersion>,
    ) -> Result<Option<Subnet>> {
        session.transaction(|s| -> Result<Option<Subnet>> {
            let filter = SubnetFilter {
                network_id: Some(request.network_id.clone()),
                segment_id: request.segment_id.clone(),
                subnet_ids: request.subnet_ids.clone(),
                ip_version: version,
            };

            for (subnet, occupied) in s.tx()?.find_subnets(&filter, LockMode::Update)? {
                if let Some(address) = request.address {
                    if !subnet.contains(&address) {
                        continue;
                    }
                }

                let excluded = match request.address {
                    Some(_) => 0,
                    None => exclusion_ranges(&subnet).size(),
                };
                if subnet.capacity() > u128::from(occupied).saturating_add(excluded) {
                    log::debug!("Selected subnet {} ({})", subnet.id, subnet.cidr);
                    return Ok(Some(subnet));
                }
            }
            Ok(None)
        })
    }

    /// Create one address row per subnet, in the order given.
    fn allocate_from_subnets<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        request: &IpRequest,
        subnets: Vec<Subnet>,
    ) -> Result<Vec<IpAddress>> {
        let net_id = request.network_id.as_str();

        session.transaction(|s| -> Result<Vec<IpAddress>> {
            let tenant = s.tenant_id().to_string();
            let tx = s.tx()?;

            let mut created = Vec::with_capacity(subnets.len());
            for mut subnet in subnets {
                let address = match request.address {
                    Some(address) => {
                        let taken = IpAddressFilter {
                            network_id: Some(net_id.to_string()),
                            address: Some(address),
                            used_by_tenant_id: Some(tenant.clone()),
                            ..Default::default()
                        };
                        if tx.find_ip_address(&taken, LockMode::Update, None)?.is_some() {
                            return Err(IpamError::ip_exhausted(net_id));
                        }
                        address
                    }
                    None => next_free_ip(tx, &mut subnet, net_id, &tenant)?,
                };

                let row = tx.create_ip_address(NewIpAddress {
                    address,
                    subnet_id: subnet.id,
                    network_id: net_id.to_string(),
                    port: request.port.clone(),
                    used_by_tenant_id: tenant.clone(),
                })?;
                log::debug!("Allocated {} from subnet {}", row.address, subnet.cidr);
                created.push(row);
            }
            Ok(created)
        })
    }

    /// Detach `port` from its addresses, or only from `address` if given.
    ///
    /// An address whose last owner leaves is marked released and a deletion
    /// event is sent after commit. Addresses still shared stay live.
    pub fn deallocate_ip<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        port: &Port,
        address: Option<IpAddr>,
    ) -> Result<Vec<IpAddress>> {
        let now = Utc::now();

        session.transaction(|s| -> Result<Vec<IpAddress>> {
            let filter = IpAddressFilter {
                address,
                port_id: Some(port.id.clone()),
                ..Default::default()
            };

            let tx = s.tx()?;
            let owned = tx.find_ip_addresses(&filter, LockMode::Update, Scope::All, None)?;

            let mut detached = Vec::with_capacity(owned.len());
            let mut released = Vec::new();
            for mut row in owned {
                if row.ports.len() == 1 {
                    released.push(AddressEvent::deleted(&row, now));
                    row.deallocated = true;
                    row.deallocated_at = Some(now);
                }
                row.detach(&port.id);
                detached.push(tx.update_ip_address(&row)?);
            }

            for event in released {
                self.notify_after_commit(s, ADDRESS_DELETE, event);
            }
            Ok(detached)
        })
    }

    fn notify_after_commit<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        event: &'static str,
        payload: AddressEvent,
    ) {
        let notifier = Arc::clone(&self.notifier);
        session.after_commit(move || notifier.notify(event, &payload));
    }
}

/// Walk `subnet`'s cursor to the next address that is neither excluded by
/// policy nor already held by the tenant, then persist the cursor.
///
/// Excluded ranges are stepped over whole, so the walk visits at most one
/// address per held row between the cursor and the end of the cidr. Running
/// off the end is reported as exhaustion.
fn next_free_ip<T: StoreTransaction>(
    tx: &mut T,
    subnet: &mut Subnet,
    net_id: &str,
    tenant: &str,
) -> Result<IpAddr> {
    let exclusions = exclusion_ranges(subnet);
    let last = subnet.last_int();
    let mut candidate = subnet.next_auto_assign_ip.max(subnet.first_int());

    let mut found = None;
    while candidate <= last {
        if let Some(excluded) = exclusions.excluded_range_at(candidate) {
            match excluded.end.checked_add(1) {
                Some(next) => candidate = next,
                None => break,
            }
            continue;
        }
        let Some(address) = int_to_ip(candidate, subnet.ip_version) else {
            break;
        };

        let taken = IpAddressFilter {
            network_id: Some(net_id.to_string()),
            address: Some(address),
            used_by_tenant_id: Some(tenant.to_string()),
            ..Default::default()
        };
        if tx.find_ip_address(&taken, LockMode::None, None)?.is_none() {
            found = Some((candidate, address));
            break;
        }
        match candidate.checked_add(1) {
            Some(next) => candidate = next,
            None => break,
        }
    }

    let Some((candidate, address)) = found else {
        log::warn!("Subnet {} ({}) has no free address past its cursor", subnet.id, subnet.cidr);
        return Err(IpamError::ip_exhausted(net_id));
    };

    subnet.next_auto_assign_ip = candidate.saturating_add(1);
    tx.update_subnet(subnet)?;
    Ok(address)
}
