//! In-memory address store.
//!
//! All state sits behind one mutex and a transaction holds the guard for its
//! whole lifetime, so transactions are fully serialised. That is stricter
//! than row locking and satisfies every [`LockMode`] request. Each
//! transaction keeps a snapshot of the state taken at `begin` and restores it
//! when dropped uncommitted.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use super::{
    AddressStore, IpAddressFilter, LockMode, MacAddressFilter, MacRangeFilter, OrderBy, Scope,
    StoreError, StoreTransaction, SubnetFilter,
};
use crate::models::{
    IpAddress, IpVersion, MacAddress, MacAddressRange, NewIpAddress, Subnet,
};

#[derive(Debug, Clone, Default)]
struct StoreState {
    // Vectors keep insertion order, which is the stable iteration order
    // allocation relies on
    mac_ranges: Vec<MacAddressRange>,
    mac_addresses: Vec<MacAddress>,
    subnets: Vec<Subnet>,
    ip_addresses: Vec<IpAddress>,
}

/// Mutex-serialised store, used by the CLI and the test suites
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // Provisioning. These bypass the allocation rules on purpose: they model
    // an administrator creating pools, or rows left over from earlier runs.

    pub fn add_mac_range(&self, range: MacAddressRange) -> Result<(), StoreError> {
        self.lock()?.mac_ranges.push(range);
        Ok(())
    }

    pub fn add_mac_address(&self, row: MacAddress) -> Result<(), StoreError> {
        self.lock()?.mac_addresses.push(row);
        Ok(())
    }

    pub fn add_subnet(&self, subnet: Subnet) -> Result<(), StoreError> {
        self.lock()?.subnets.push(subnet);
        Ok(())
    }

    pub fn add_ip_address(&self, row: IpAddress) -> Result<(), StoreError> {
        self.lock()?.ip_addresses.push(row);
        Ok(())
    }

    /// Replace a subnet outside of allocation, e.g. after a resize
    pub fn replace_subnet(&self, subnet: Subnet) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let slot = state
            .subnets
            .iter_mut()
            .find(|s| s.id == subnet.id)
            .ok_or(StoreError::RowNotFound { kind: "subnet", id: subnet.id })?;
        *slot = subnet;
        Ok(())
    }

    // Read-only snapshots

    pub fn subnet(&self, id: Uuid) -> Result<Option<Subnet>, StoreError> {
        Ok(self.lock()?.subnets.iter().find(|s| s.id == id).cloned())
    }

    pub fn mac_range(&self, id: Uuid) -> Result<Option<MacAddressRange>, StoreError> {
        Ok(self.lock()?.mac_ranges.iter().find(|r| r.id == id).cloned())
    }

    pub fn ip_addresses(&self) -> Result<Vec<IpAddress>, StoreError> {
        Ok(self.lock()?.ip_addresses.clone())
    }

    pub fn mac_addresses(&self) -> Result<Vec<MacAddress>, StoreError> {
        Ok(self.lock()?.mac_addresses.clone())
    }
}

impl AddressStore for MemoryStore {
    type Transaction<'a> = MemoryTransaction<'a>;

    fn begin(&self) -> Result<MemoryTransaction<'_>, StoreError> {
        let state = self.lock()?;
        let snapshot = state.clone();
        Ok(MemoryTransaction {
            state,
            snapshot: Some(snapshot),
        })
    }
}

/// An open transaction; rolls back on drop unless committed
pub struct MemoryTransaction<'a> {
    state: MutexGuard<'a, StoreState>,
    snapshot: Option<StoreState>,
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.state = snapshot;
        }
    }
}

fn limit<T>(mut rows: Vec<T>, scope: Scope) -> Vec<T> {
    if scope == Scope::One {
        rows.truncate(1);
    }
    rows
}

fn mac_matches(row: &MacAddress, filter: &MacAddressFilter) -> bool {
    filter.address.map_or(true, |a| row.address == a)
        && filter.tenant_id.as_ref().map_or(true, |t| &row.tenant_id == t)
        && filter.deallocated.map_or(true, |d| row.deallocated == d)
        && filter
            .deallocated_before
            .map_or(true, |cutoff| row.deallocated_at.is_some_and(|at| at <= cutoff))
}

fn subnet_matches(subnet: &Subnet, filter: &SubnetFilter) -> bool {
    filter.network_id.as_ref().map_or(true, |n| &subnet.network_id == n)
        && filter
            .segment_id
            .as_ref()
            .map_or(true, |seg| subnet.segment_id.as_ref() == Some(seg))
        && filter.subnet_ids.as_ref().map_or(true, |ids| ids.contains(&subnet.id))
        && filter.ip_version.map_or(true, |v| subnet.ip_version == v)
}

fn ip_matches(row: &IpAddress, filter: &IpAddressFilter) -> bool {
    filter.network_id.as_ref().map_or(true, |n| &row.network_id == n)
        && filter.address.map_or(true, |a| row.address == a)
        && filter
            .used_by_tenant_id
            .as_ref()
            .map_or(true, |t| &row.used_by_tenant_id == t)
        && filter.deallocated.map_or(true, |d| row.deallocated == d)
        && filter
            .deallocated_before
            .map_or(true, |cutoff| row.deallocated_at.is_some_and(|at| at <= cutoff))
        && filter
            .subnet_ids
            .as_ref()
            .map_or(true, |ids| row.subnet_id.is_some_and(|id| ids.contains(&id)))
        && filter.versions.as_ref().map_or(true, |vs| vs.contains(&row.version))
        && filter.port_id.as_ref().map_or(true, |p| row.is_owned_by(p))
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn find_mac_ranges(
        &mut self,
        filter: &MacRangeFilter,
        _lock: LockMode,
    ) -> Result<Vec<(MacAddressRange, u64)>, StoreError> {
        let state = &*self.state;
        Ok(state
            .mac_ranges
            .iter()
            .filter(|r| filter.containing.map_or(true, |a| r.contains(a)))
            .map(|r| {
                let count = state
                    .mac_addresses
                    .iter()
                    .filter(|m| m.mac_address_range_id == r.id)
                    .count() as u64;
                (r.clone(), count)
            })
            .collect())
    }

    fn update_mac_range(&mut self, range: &MacAddressRange) -> Result<(), StoreError> {
        let slot = self
            .state
            .mac_ranges
            .iter_mut()
            .find(|r| r.id == range.id)
            .ok_or(StoreError::RowNotFound { kind: "mac_address_range", id: range.id })?;
        *slot = range.clone();
        Ok(())
    }

    fn find_mac_addresses(
        &mut self,
        filter: &MacAddressFilter,
        _lock: LockMode,
        scope: Scope,
    ) -> Result<Vec<MacAddress>, StoreError> {
        let rows = self
            .state
            .mac_addresses
            .iter()
            .filter(|m| mac_matches(m, filter))
            .cloned()
            .collect();
        Ok(limit(rows, scope))
    }

    fn create_mac_address(
        &mut self,
        range_id: Uuid,
        address: u64,
        tenant_id: &str,
    ) -> Result<MacAddress, StoreError> {
        if self
            .state
            .mac_addresses
            .iter()
            .any(|m| m.address == address && m.tenant_id == tenant_id)
        {
            return Err(StoreError::Conflict(format!(
                "MAC address {:#014x} already exists for tenant {}",
                address, tenant_id
            )));
        }

        let row = MacAddress {
            id: Uuid::new_v4(),
            address,
            mac_address_range_id: range_id,
            tenant_id: tenant_id.to_string(),
            deallocated: false,
            deallocated_at: None,
            created_at: Utc::now(),
        };
        self.state.mac_addresses.push(row.clone());
        Ok(row)
    }

    fn update_mac_address(&mut self, row: &MacAddress) -> Result<MacAddress, StoreError> {
        let slot = self
            .state
            .mac_addresses
            .iter_mut()
            .find(|m| m.id == row.id)
            .ok_or(StoreError::RowNotFound { kind: "mac_address", id: row.id })?;
        *slot = row.clone();
        Ok(row.clone())
    }

    fn find_subnets(
        &mut self,
        filter: &SubnetFilter,
        _lock: LockMode,
    ) -> Result<Vec<(Subnet, u64)>, StoreError> {
        let state = &*self.state;
        Ok(state
            .subnets
            .iter()
            .filter(|s| subnet_matches(s, filter))
            .map(|s| {
                let count = state
                    .ip_addresses
                    .iter()
                    .filter(|ip| ip.subnet_id == Some(s.id))
                    .count() as u64;
                (s.clone(), count)
            })
            .collect())
    }

    fn update_subnet(&mut self, subnet: &Subnet) -> Result<(), StoreError> {
        let slot = self
            .state
            .subnets
            .iter_mut()
            .find(|s| s.id == subnet.id)
            .ok_or(StoreError::RowNotFound { kind: "subnet", id: subnet.id })?;
        *slot = subnet.clone();
        Ok(())
    }

    fn find_ip_addresses(
        &mut self,
        filter: &IpAddressFilter,
        _lock: LockMode,
        scope: Scope,
        order_by: Option<OrderBy>,
    ) -> Result<Vec<IpAddress>, StoreError> {
        let mut rows: Vec<IpAddress> = self
            .state
            .ip_addresses
            .iter()
            .filter(|ip| ip_matches(ip, filter))
            .cloned()
            .collect();

        if let Some(OrderBy::Address) = order_by {
            rows.sort_by_key(|ip| ip.address_int());
        }
        Ok(limit(rows, scope))
    }

    fn create_ip_address(&mut self, new: NewIpAddress) -> Result<IpAddress, StoreError> {
        let now = Utc::now();
        let row = IpAddress {
            id: Uuid::new_v4(),
            address: new.address,
            version: IpVersion::of(&new.address),
            subnet_id: Some(new.subnet_id),
            network_id: new.network_id,
            ports: vec![new.port],
            used_by_tenant_id: new.used_by_tenant_id,
            deallocated: false,
            deallocated_at: None,
            allocated_at: Some(now),
            created_at: now,
        };
        self.state.ip_addresses.push(row.clone());
        Ok(row)
    }

    fn update_ip_address(&mut self, row: &IpAddress) -> Result<IpAddress, StoreError> {
        let slot = self
            .state
            .ip_addresses
            .iter_mut()
            .find(|ip| ip.id == row.id)
            .ok_or(StoreError::RowNotFound { kind: "ip_address", id: row.id })?;
        *slot = row.clone();
        Ok(row.clone())
    }

    fn delete_ip_address(&mut self, id: Uuid) -> Result<(), StoreError> {
        let before = self.state.ip_addresses.len();
        self.state.ip_addresses.retain(|ip| ip.id != id);
        if self.state.ip_addresses.len() == before {
            return Err(StoreError::RowNotFound { kind: "ip_address", id });
        }
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }
}
