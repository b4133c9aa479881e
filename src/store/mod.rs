//! Address store contract.
//!
//! The allocation engine never touches storage directly. Every read and write
//! goes through a [`StoreTransaction`] obtained from an [`AddressStore`], and
//! every transaction is opened through a [`Session`], which carries the
//! caller's tenant scope and makes nested scopes join the open transaction
//! instead of starting an isolated one.
//!
//! ## Locking
//!
//! Reads that precede a mutation pass [`LockMode::Update`]. A backend must
//! hold the returned rows (or something coarser) until the transaction ends,
//! so two concurrent callers scanning the same pool serialise behind each
//! other and never observe the same cursor value.
//!
//! ## Rollback
//!
//! A transaction that is dropped without [`StoreTransaction::commit`] rolls
//! back. [`Session::transaction`] commits only when its closure returns `Ok`.

pub mod memory;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{IpAddress, IpVersion, MacAddress, MacAddressRange, NewIpAddress, Subnet};

pub use memory::MemoryStore;

/// Store-level failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Address store lock poisoned")]
    LockPoisoned,

    #[error("No transaction is active on this session")]
    NoActiveTransaction,

    #[error("{kind} {id} not found")]
    RowNotFound { kind: &'static str, id: Uuid },

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Row locking requested by a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    /// Hold the rows for update until the transaction ends
    Update,
}

/// How many rows a find may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    One,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// Lowest address first
    Address,
}

#[derive(Debug, Clone, Default)]
pub struct MacRangeFilter {
    /// Only ranges containing this address
    pub containing: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MacAddressFilter {
    pub address: Option<u64>,
    pub tenant_id: Option<String>,
    pub deallocated: Option<bool>,
    /// Only rows deallocated at or before this instant
    pub deallocated_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SubnetFilter {
    pub network_id: Option<String>,
    pub segment_id: Option<String>,
    pub subnet_ids: Option<Vec<Uuid>>,
    pub ip_version: Option<IpVersion>,
}

impl SubnetFilter {
    pub fn by_id(id: Uuid) -> Self {
        Self {
            subnet_ids: Some(vec![id]),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpAddressFilter {
    pub network_id: Option<String>,
    pub address: Option<IpAddr>,
    pub used_by_tenant_id: Option<String>,
    pub deallocated: Option<bool>,
    /// Only rows deallocated at or before this instant
    pub deallocated_before: Option<DateTime<Utc>>,
    pub subnet_ids: Option<Vec<Uuid>>,
    pub versions: Option<Vec<IpVersion>>,
    /// Only rows owned by this port
    pub port_id: Option<String>,
}

/// Operations available inside one transaction
pub trait StoreTransaction {
    /// MAC ranges with the number of rows drawn from each
    fn find_mac_ranges(
        &mut self,
        filter: &MacRangeFilter,
        lock: LockMode,
    ) -> Result<Vec<(MacAddressRange, u64)>, StoreError>;

    fn update_mac_range(&mut self, range: &MacAddressRange) -> Result<(), StoreError>;

    fn find_mac_addresses(
        &mut self,
        filter: &MacAddressFilter,
        lock: LockMode,
        scope: Scope,
    ) -> Result<Vec<MacAddress>, StoreError>;

    fn create_mac_address(
        &mut self,
        range_id: Uuid,
        address: u64,
        tenant_id: &str,
    ) -> Result<MacAddress, StoreError>;

    fn update_mac_address(&mut self, row: &MacAddress) -> Result<MacAddress, StoreError>;

    /// Subnets with the number of address rows each one holds
    fn find_subnets(
        &mut self,
        filter: &SubnetFilter,
        lock: LockMode,
    ) -> Result<Vec<(Subnet, u64)>, StoreError>;

    fn update_subnet(&mut self, subnet: &Subnet) -> Result<(), StoreError>;

    fn find_ip_addresses(
        &mut self,
        filter: &IpAddressFilter,
        lock: LockMode,
        scope: Scope,
        order_by: Option<OrderBy>,
    ) -> Result<Vec<IpAddress>, StoreError>;

    fn create_ip_address(&mut self, new: NewIpAddress) -> Result<IpAddress, StoreError>;

    fn update_ip_address(&mut self, row: &IpAddress) -> Result<IpAddress, StoreError>;

    fn delete_ip_address(&mut self, id: Uuid) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    fn find_mac_address(
        &mut self,
        filter: &MacAddressFilter,
        lock: LockMode,
    ) -> Result<Option<MacAddress>, StoreError> {
        Ok(self.find_mac_addresses(filter, lock, Scope::One)?.into_iter().next())
    }

    fn find_ip_address(
        &mut self,
        filter: &IpAddressFilter,
        lock: LockMode,
        order_by: Option<OrderBy>,
    ) -> Result<Option<IpAddress>, StoreError> {
        Ok(self
            .find_ip_addresses(filter, lock, Scope::One, order_by)?
            .into_iter()
            .next())
    }
}

/// A transactional backend shared by every caller
pub trait AddressStore: Send + Sync {
    type Transaction<'a>: StoreTransaction
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Transaction<'_>, StoreError>;
}

/// Callback queued to run once the outermost scope commits
type Deferred<'s> = Box<dyn FnOnce() + 's>;

/// A caller's view of the store: tenant scope plus at most one open transaction
pub struct Session<'s, S: AddressStore> {
    store: &'s S,
    tenant_id: String,
    tx: Option<S::Transaction<'s>>,
    deferred: Vec<Deferred<'s>>,
}

impl<'s, S: AddressStore> Session<'s, S> {
    pub fn new(store: &'s S, tenant_id: &str) -> Self {
        Self {
            store,
            tenant_id: tenant_id.to_string(),
            tx: None,
            deferred: Vec::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Run `f` inside a transaction.
    ///
    /// If one is already open the closure joins it and the outermost scope
    /// decides the outcome. Otherwise a transaction is begun here, committed
    /// when `f` returns `Ok` and rolled back on `Err` (or on unwind, when the
    /// transaction is dropped).
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<StoreError>,
    {
        if self.tx.is_some() {
            return f(self);
        }

        self.tx = Some(self.store.begin()?);
        let outcome = f(self);
        let tx = self.tx.take();

        let deferred = std::mem::take(&mut self.deferred);

        match (outcome, tx) {
            (Ok(value), Some(tx)) => {
                tx.commit()?;
                deferred.into_iter().for_each(|f| f());
                Ok(value)
            }
            (Ok(_), None) => Err(StoreError::NoActiveTransaction.into()),
            (Err(e), tx) => {
                drop(tx);
                log::debug!(
                    "Transaction rolled back for tenant {}, dropping {} deferred callback(s)",
                    self.tenant_id,
                    deferred.len()
                );
                Err(e)
            }
        }
    }

    /// Run `f` once the outermost open transaction commits, or right away
    /// when none is open. Dropped if the transaction rolls back.
    pub fn after_commit<F: FnOnce() + 's>(&mut self, f: F) {
        if self.tx.is_some() {
            self.deferred.push(Box::new(f));
        } else {
            f();
        }
    }

    /// The open transaction
    pub fn tx(&mut self) -> Result<&mut S::Transaction<'s>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::NoActiveTransaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Port, Subnet};

    fn store_with_subnet() -> (MemoryStore, Subnet) {
        let store = MemoryStore::new();
        let subnet = Subnet::new("net", "10.0.0.0/24".parse().unwrap());
        store.add_subnet(subnet.clone()).unwrap();
        (store, subnet)
    }

    fn new_ip(subnet: &Subnet, addr: &str) -> NewIpAddress {
        NewIpAddress {
            address: addr.parse().unwrap(),
            subnet_id: subnet.id,
            network_id: "net".to_string(),
            port: Port::new("p1", "vm1"),
            used_by_tenant_id: "tenant".to_string(),
        }
    }

    #[test]
    fn test_tx_outside_scope_is_an_error() {
        let (store, _) = store_with_subnet();
        let mut session = Session::new(&store, "tenant");
        assert!(!session.in_transaction());
        assert!(matches!(session.tx(), Err(StoreError::NoActiveTransaction)));
    }

    #[test]
    fn test_commit_on_ok() {
        let (store, subnet) = store_with_subnet();
        let mut session = Session::new(&store, "tenant");

        session
            .transaction(|s| -> Result<(), StoreError> {
                s.tx()?.create_ip_address(new_ip(&subnet, "10.0.0.1"))?;
                Ok(())
            })
            .unwrap();

        assert!(!session.in_transaction());
        assert_eq!(store.ip_addresses().unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_on_err() {
        let (store, subnet) = store_with_subnet();
        let mut session = Session::new(&store, "tenant");

        let result = session.transaction(|s| -> Result<(), StoreError> {
            s.tx()?.create_ip_address(new_ip(&subnet, "10.0.0.1"))?;
            Err(StoreError::Conflict("forced".to_string()))
        });

        assert!(result.is_err());
        assert!(store.ip_addresses().unwrap().is_empty());
    }

    #[test]
    fn test_nested_scope_joins_outer() {
        let (store, subnet) = store_with_subnet();
        let mut session = Session::new(&store, "tenant");

        // The inner scope succeeds but the outer one fails, so nothing the
        // inner scope wrote may survive
        let result = session.transaction(|s| -> Result<(), StoreError> {
            s.transaction(|inner| -> Result<(), StoreError> {
                assert!(inner.in_transaction());
                inner.tx()?.create_ip_address(new_ip(&subnet, "10.0.0.1"))?;
                Ok(())
            })?;
            assert!(s.in_transaction());
            Err(StoreError::Conflict("outer failed".to_string()))
        });

        assert!(result.is_err());
        assert!(store.ip_addresses().unwrap().is_empty());
    }

    #[test]
    fn test_after_commit_runs_only_on_commit() {
        use std::cell::Cell;

        let (store, _) = store_with_subnet();
        let fired = Cell::new(0);
        let mut session = Session::new(&store, "tenant");

        session
            .transaction(|s| -> Result<(), StoreError> {
                s.transaction(|inner| -> Result<(), StoreError> {
                    inner.after_commit(|| fired.set(fired.get() + 1));
                    Ok(())
                })?;
                // Still inside the outer scope
                assert_eq!(fired.get(), 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(fired.get(), 1);

        let _ = session.transaction(|s| -> Result<(), StoreError> {
            s.after_commit(|| fired.set(fired.get() + 10));
            Err(StoreError::Conflict("rolled back".to_string()))
        });
        assert_eq!(fired.get(), 1);

        session.after_commit(|| fired.set(fired.get() + 100));
        assert_eq!(fired.get(), 101);
    }
}
