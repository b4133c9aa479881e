//! # Netipam - MAC and IP address management for virtual networks
//!
//! This library hands out MAC and IP addresses to ports on virtual networks,
//! drawing from administrator-defined pools: MAC address ranges and IPv4/IPv6
//! subnets with optional exclusion policies.
//!
//! ## Overview
//!
//! Every allocation runs inside a transaction against an address store, so
//! concurrent callers never receive the same address. Released addresses are
//! kept as soft-deleted rows and recycled once a configurable reuse-after
//! window has passed; only then are fresh addresses drawn from the pools.
//!
//! ## Key Features
//!
//! - **Reclaim before create**: released addresses are reused lowest first
//! - **Dual-stack strategies**: `ANY`, `BOTH` and `BOTH_REQUIRED`
//! - **IP policies**: excluded blocks never handed out, counted against capacity
//! - **Segmented networks**: shared networks allocate per segment
//! - **Self-healing**: reclaimable rows found outside their subnet are purged
//! - **Lifecycle events**: create and delete notifications after commit
//!
//! ## Architecture
//!
//! - `models`: MAC ranges, subnets and address rows
//! - `policy`: IP policy exclusions and their arithmetic
//! - `store`: the transactional store contract and an in-memory backend
//! - `ipam`: the allocation engine, its strategies and the strategy registry
//! - `notify`: address lifecycle notifications
//! - `ports`: port provisioning and release on top of the engine
//! - `config`, `config_loader`: YAML configuration and pool seeding
//! - `error`: error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use netipam::ipam::StrategyRegistry;
//! use netipam::notify::LogNotifier;
//! use netipam::ports::{provision_port, PortRequest};
//! use netipam::store::{MemoryStore, Session};
//! use netipam::config_loader;
//!
//! let config = config_loader::load_config(Path::new("netipam.yaml"))?;
//! let store = MemoryStore::new();
//! config_loader::seed_store(&config, &store)?;
//!
//! let registry = StrategyRegistry::new(&config.ipam.default_strategy, Arc::new(LogNotifier))?;
//! let network = config.network("net-1").cloned().unwrap_or_else(|| netipam::ports::Network::new("net-1"));
//!
//! let mut session = Session::new(&store, &config.ipam.tenant_id);
//! let port = provision_port(
//!     &registry,
//!     &mut session,
//!     &network,
//!     &PortRequest::new("vm-1"),
//!     config.ipam.reuse_after,
//! )?;
//! println!("{} {:?}", port.mac.mac(), port.ips);
//! # Ok::<(), color_eyre::eyre::Error>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```yaml
//! ipam:
//!   default_strategy: ANY
//!   reuse_after: 5m
//!   tenant_id: default
//!
//! networks:
//!   - id: net-1
//!     ipam_strategy: BOTH
//!
//! mac_ranges:
//!   - first_address: "02:00:00:00:00:00"
//!     last_address: "02:00:00:ff:ff:ff"
//!
//! subnets:
//!   - network_id: net-1
//!     cidr: 10.0.0.0/24
//!     exclude: [10.0.0.0/32, 10.0.0.255/32]
//!   - network_id: net-1
//!     cidr: fd00::/64
//! ```
//!
//! ## Error Handling
//!
//! Allocation functions return [`error::Result`] with a typed
//! [`error::IpamError`]. Configuration loading returns `color_eyre` reports
//! with file context attached.

pub mod config;
pub mod config_loader;
pub mod error;
pub mod ipam;
pub mod models;
pub mod notify;
pub mod policy;
pub mod ports;
pub mod store;
