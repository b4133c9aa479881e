//! MAC address allocation.

use std::time::Duration;

use chrono::Utc;

use super::{reuse_cutoff, Ipam};
use crate::error::{IpamError, Result};
use crate::models::{MacAddr, MacAddress, MacAddressRange};
use crate::store::{
    AddressStore, LockMode, MacAddressFilter, MacRangeFilter, Session, StoreTransaction,
};

impl Ipam {
    /// Hand out a MAC address for `port_id` on `net_id`.
    ///
    /// A released row past its reuse-after window is recycled first. Failing
    /// that, a fresh address is drawn from the first range with room: the
    /// requested one if given, otherwise the range's next free value.
    pub fn allocate_mac<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        net_id: &str,
        port_id: &str,
        reuse_after: Duration,
        requested: Option<MacAddr>,
    ) -> Result<MacAddress> {
        let requested = requested.map(MacAddr::value);
        let cutoff = reuse_cutoff(reuse_after);

        let recycled = session.transaction(|s| -> Result<Option<MacAddress>> {
            let tenant = s.tenant_id().to_string();
            let filter = MacAddressFilter {
                address: requested,
                deallocated: Some(true),
                deallocated_before: Some(cutoff),
                ..Default::default()
            };

            let tx = s.tx()?;
            let Some(mut row) = tx.find_mac_address(&filter, LockMode::Update)? else {
                return Ok(None);
            };
            row.deallocated = false;
            row.deallocated_at = None;
            row.tenant_id = tenant;
            Ok(Some(tx.update_mac_address(&row)?))
        })?;

        if let Some(row) = recycled {
            log::debug!("Recycled MAC {} for port {}", row.mac(), port_id);
            return Ok(row);
        }

        session.transaction(|s| -> Result<MacAddress> {
            let tenant = s.tenant_id().to_string();
            let tx = s.tx()?;

            let ranges =
                tx.find_mac_ranges(&MacRangeFilter { containing: requested }, LockMode::Update)?;
            for (mut range, occupied) in ranges {
                if range.is_exhausted(occupied) {
                    continue;
                }

                let address = match requested {
                    Some(address) => address,
                    None => match next_free_mac(tx, &mut range, &tenant)? {
                        Some(address) => address,
                        None => {
                            log::warn!(
                                "MAC range {} cursor is past its last address, skipping",
                                range.id
                            );
                            continue;
                        }
                    },
                };

                let row = tx.create_mac_address(range.id, address, &tenant)?;
                log::debug!("Allocated MAC {} for port {}", row.mac(), port_id);
                return Ok(row);
            }

            Err(IpamError::mac_exhausted(net_id))
        })
    }

    /// Mark the caller's row for `address` as released.
    ///
    /// The row is kept so the address can be recycled once its reuse-after
    /// window has passed.
    pub fn deallocate_mac<S: AddressStore>(
        &self,
        session: &mut Session<'_, S>,
        address: MacAddr,
    ) -> Result<MacAddress> {
        session.transaction(|s| -> Result<MacAddress> {
            let filter = MacAddressFilter {
                address: Some(address.value()),
                tenant_id: Some(s.tenant_id().to_string()),
                ..Default::default()
            };

            let tx = s.tx()?;
            let mut row = tx
                .find_mac_address(&filter, LockMode::Update)?
                .ok_or(IpamError::MacAddressNotFound(address))?;
            row.deallocated = true;
            row.deallocated_at = Some(Utc::now());
            Ok(tx.update_mac_address(&row)?)
        })
    }
}

/// Advance `range`'s cursor to the next value the tenant does not hold.
///
/// The cursor is written back whether or not a value was found; it only
/// survives if the enclosing transaction commits.
fn next_free_mac<T: StoreTransaction>(
    tx: &mut T,
    range: &mut MacAddressRange,
    tenant: &str,
) -> Result<Option<u64>> {
    let mut cursor = range.next_auto_assign_mac.max(range.first_address);
    let found = loop {
        if cursor > range.last_address {
            break None;
        }
        let candidate = cursor;
        cursor += 1;

        let taken = MacAddressFilter {
            address: Some(candidate),
            tenant_id: Some(tenant.to_string()),
            ..Default::default()
        };
        if tx.find_mac_address(&taken, LockMode::None)?.is_none() {
            break Some(candidate);
        }
    };

    range.next_auto_assign_mac = cursor;
    tx.update_mac_range(range)?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::AnyStrategy;
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const BASE: u64 = 0x0200_0000_0000;

    fn ipam() -> Ipam {
        Ipam::new(Arc::new(AnyStrategy), Arc::new(RecordingNotifier::new()))
    }

    fn store_with_range(first: u64, last: u64) -> (MemoryStore, MacAddressRange) {
        let store = MemoryStore::new();
        let range = MacAddressRange::new(MacAddr::new(first).unwrap(), MacAddr::new(last).unwrap());
        store.add_mac_range(range.clone()).unwrap();
        (store, range)
    }

    fn mac(value: u64) -> MacAddr {
        MacAddr::new(value).unwrap()
    }

    #[test]
    fn test_fresh_draw_walks_the_cursor() {
        let (store, range) = store_with_range(BASE, BASE + 0xff);
        let mut session = Session::new(&store, "tenant");
        let ipam = ipam();

        let first = ipam.allocate_mac(&mut session, "net", "p1", Duration::ZERO, None).unwrap();
        let second = ipam.allocate_mac(&mut session, "net", "p2", Duration::ZERO, None).unwrap();
        assert_eq!(first.address, BASE);
        assert_eq!(second.address, BASE + 1);
        assert_eq!(first.mac_address_range_id, range.id);

        let stored = store.mac_range(range.id).unwrap().unwrap();
        assert_eq!(stored.next_auto_assign_mac, BASE + 2);
    }

    #[test]
    fn test_requested_address_is_honoured() {
        let (store, _) = store_with_range(BASE, BASE + 0xff);
        let mut session = Session::new(&store, "tenant");

        let row = ipam()
            .allocate_mac(&mut session, "net", "p1", Duration::ZERO, Some(mac(BASE + 0x42)))
            .unwrap();
        assert_eq!(row.address, BASE + 0x42);
    }

    #[test]
    fn test_requested_address_outside_every_range() {
        let (store, _) = store_with_range(BASE, BASE + 0xff);
        let mut session = Session::new(&store, "tenant");

        let err = ipam()
            .allocate_mac(&mut session, "net-1", "p1", Duration::ZERO, Some(mac(BASE + 0x1000)))
            .unwrap_err();
        assert!(matches!(err, IpamError::MacAddressGenerationFailure { ref net_id } if net_id == "net-1"));
    }

    #[test]
    fn test_duplicate_request_conflicts() {
        let (store, _) = store_with_range(BASE, BASE + 0xff);
        let mut session = Session::new(&store, "tenant");
        let ipam = ipam();

        ipam.allocate_mac(&mut session, "net", "p1", Duration::ZERO, Some(mac(BASE + 7)))
            .unwrap();
        let err = ipam
            .allocate_mac(&mut session, "net", "p2", Duration::ZERO, Some(mac(BASE + 7)))
            .unwrap_err();
        assert!(matches!(err, IpamError::Store(crate::store::StoreError::Conflict(_))));
        assert_eq!(store.mac_addresses().unwrap().len(), 1);
    }

    #[test]
    fn test_cursor_skips_addresses_already_held() {
        let (store, range) = store_with_range(BASE, BASE + 0xff);
        let mut session = Session::new(&store, "tenant");
        let ipam = ipam();

        ipam.allocate_mac(&mut session, "net", "p1", Duration::ZERO, Some(mac(BASE)))
            .unwrap();
        let drawn = ipam.allocate_mac(&mut session, "net", "p2", Duration::ZERO, None).unwrap();
        assert_eq!(drawn.address, BASE + 1);
        assert_eq!(store.mac_range(range.id).unwrap().unwrap().next_auto_assign_mac, BASE + 2);
    }

    #[test]
    fn test_small_range_exhausts() {
        // Three addresses, one of which is held in reserve
        let (store, _) = store_with_range(BASE, BASE + 2);
        let mut session = Session::new(&store, "tenant");
        let ipam = ipam();

        ipam.allocate_mac(&mut session, "net", "p1", Duration::ZERO, None).unwrap();
        ipam.allocate_mac(&mut session, "net", "p2", Duration::ZERO, None).unwrap();
        let err = ipam
            .allocate_mac(&mut session, "net", "p3", Duration::ZERO, None)
            .unwrap_err();
        assert!(err.is_exhaustion());
    }

    #[test]
    fn test_failed_walk_leaves_cursor_untouched() {
        let store = MemoryStore::new();
        let mut range = MacAddressRange::new(mac(BASE), mac(BASE + 3));
        range.next_auto_assign_mac = BASE + 2;
        store.add_mac_range(range.clone()).unwrap();
        let mut session = Session::new(&store, "tenant");
        let ipam = ipam();

        // Everything past the cursor is already held
        for held in [BASE + 2, BASE + 3] {
            ipam.allocate_mac(&mut session, "net", "p1", Duration::ZERO, Some(mac(held)))
                .unwrap();
        }
        let err = ipam
            .allocate_mac(&mut session, "net", "p2", Duration::ZERO, None)
            .unwrap_err();
        assert!(err.is_exhaustion());
        assert_eq!(store.mac_range(range.id).unwrap().unwrap().next_auto_assign_mac, BASE + 2);
    }

    #[test]
    fn test_range_with_spent_cursor_is_skipped() {
        let store = MemoryStore::new();
        let mut spent = MacAddressRange::new(mac(BASE), mac(BASE + 0xff));
        spent.next_auto_assign_mac = BASE + 0x100;
        store.add_mac_range(spent).unwrap();
        let fresh = MacAddressRange::new(mac(BASE + 0x1000), mac(BASE + 0x10ff));
        store.add_mac_range(fresh.clone()).unwrap();

        let mut session = Session::new(&store, "tenant");
        let row = ipam().allocate_mac(&mut session, "net", "p1", Duration::ZERO, None).unwrap();
        assert_eq!(row.mac_address_range_id, fresh.id);
        assert_eq!(row.address, BASE + 0x1000);
    }

    #[test]
    fn test_released_mac_is_recycled_after_window() {
        let (store, _) = store_with_range(BASE, BASE + 0xff);
        let ipam = ipam();

        let mut alice = Session::new(&store, "alice");
        let row = ipam.allocate_mac(&mut alice, "net", "p1", Duration::ZERO, None).unwrap();
        ipam.deallocate_mac(&mut alice, row.mac()).unwrap();

        // Window not yet elapsed: a fresh value is drawn instead
        let mut bob = Session::new(&store, "bob");
        let fresh = ipam
            .allocate_mac(&mut bob, "net", "p2", Duration::from_secs(3600), None)
            .unwrap();
        assert_ne!(fresh.id, row.id);

        let recycled = ipam.allocate_mac(&mut bob, "net", "p3", Duration::ZERO, None).unwrap();
        assert_eq!(recycled.id, row.id);
        assert_eq!(recycled.tenant_id, "bob");
        assert!(!recycled.deallocated);
        assert!(recycled.deallocated_at.is_none());
    }

    #[test]
    fn test_deallocate_unknown_mac() {
        let (store, _) = store_with_range(BASE, BASE + 0xff);
        let mut session = Session::new(&store, "tenant");
        let err = ipam().deallocate_mac(&mut session, mac(BASE + 3)).unwrap_err();
        assert!(matches!(err, IpamError::MacAddressNotFound(m) if m == mac(BASE + 3)));
    }

    #[test]
    fn test_deallocate_is_tenant_scoped() {
        let (store, _) = store_with_range(BASE, BASE + 0xff);
        let ipam = ipam();

        let mut alice = Session::new(&store, "alice");
        let row = ipam.allocate_mac(&mut alice, "net", "p1", Duration::ZERO, None).unwrap();

        let mut bob = Session::new(&store, "bob");
        assert!(ipam.deallocate_mac(&mut bob, row.mac()).is_err());

        let released = ipam.deallocate_mac(&mut alice, row.mac()).unwrap();
        assert!(released.deallocated);
        assert!(released.deallocated_at.is_some());
    }
}
