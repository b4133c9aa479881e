//! Address pool rows.
//!
//! These are the entities the allocation engine reads and writes through an
//! [`AddressStore`](crate::store::AddressStore). The store owns their
//! durability; the engine owns the rules about which rows may be handed out.

pub mod ip_address;
pub mod mac;
pub mod subnet;

pub use ip_address::{IpAddress, NewIpAddress, Port};
pub use mac::{MacAddr, MacAddress, MacAddressRange};
pub use subnet::{int_to_ip, ip_to_int, IpVersion, Subnet};
