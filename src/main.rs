use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::info;
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use netipam::config::Config;
use netipam::config_loader;
use netipam::error::IpamError;
use netipam::ipam::StrategyRegistry;
use netipam::notify::LogNotifier;
use netipam::ports::{provision_port, release_port, Network, PortAllocation, PortRequest};
use netipam::store::{MemoryStore, Session};

/// Allocate MAC and IP addresses for ports on a virtual network
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the address pool configuration YAML file
    #[arg(short, long)]
    config: PathBuf,

    /// Network to create ports on
    #[arg(short, long)]
    network: String,

    /// Number of ports to provision
    #[arg(short, long, default_value_t = 1)]
    ports: usize,

    /// Release this many of the provisioned ports afterwards
    #[arg(long, default_value_t = 0)]
    release: usize,

    /// Override the network's IPAM strategy
    #[arg(long)]
    strategy: Option<String>,

    /// Segment of a shared network
    #[arg(long)]
    segment: Option<String>,

    /// Provision ports concurrently
    #[arg(long)]
    parallel: bool,
}

#[derive(Debug, Serialize)]
struct PortReport {
    port_id: String,
    device_id: String,
    mac_address: String,
    ip_addresses: Vec<String>,
    released: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    network: String,
    strategy: String,
    tenant_id: String,
    ports: Vec<PortReport>,
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("Configuration file: {:?}", args.config);

    let config = config_loader::load_config(&args.config)?;
    let report = run(&args, &config)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run(args: &Args, config: &Config) -> Result<Report> {
    let store = MemoryStore::new();
    let seeded = config_loader::seed_store(config, &store)?;
    info!(
        "Seeded {} MAC range(s) and {} subnet(s)",
        seeded.mac_ranges, seeded.subnets
    );

    let registry = StrategyRegistry::new(&config.ipam.default_strategy, Arc::new(LogNotifier))?;

    let mut network: Network = config
        .network(&args.network)
        .cloned()
        .ok_or_else(|| eyre!("Network {} is not declared in the configuration", args.network))?;
    if let Some(strategy) = &args.strategy {
        network.ipam_strategy = Some(strategy.clone());
    }
    let strategy = match &network.ipam_strategy {
        Some(name) => registry.resolve(name).strategy_name(),
        None => registry.default_engine().strategy_name(),
    };

    let tenant_id = config.ipam.tenant_id.as_str();
    let reuse_after = config.ipam.reuse_after;
    let request_for = |i: usize| PortRequest {
        segment_id: args.segment.clone(),
        ..PortRequest::new(&format!("device-{}", i))
    };

    info!(
        "Provisioning {} port(s) on {} with strategy {}",
        args.ports, network.id, strategy
    );
    let allocations: Vec<PortAllocation> = if args.parallel {
        (0..args.ports)
            .into_par_iter()
            .map(|i| {
                let mut session = Session::new(&store, tenant_id);
                provision_port(&registry, &mut session, &network, &request_for(i), reuse_after)
            })
            .collect::<Result<Vec<_>, IpamError>>()
    } else {
        let mut session = Session::new(&store, tenant_id);
        (0..args.ports)
            .map(|i| provision_port(&registry, &mut session, &network, &request_for(i), reuse_after))
            .collect::<Result<Vec<_>, IpamError>>()
    }
    .wrap_err("Port provisioning failed")?;

    let mut session = Session::new(&store, tenant_id);
    for allocation in allocations.iter().take(args.release) {
        release_port(
            &registry,
            &mut session,
            &network,
            &allocation.port,
            allocation.mac.mac(),
        )
        .wrap_err_with(|| format!("Failed to release port {}", allocation.port.id))?;
    }

    let ports = allocations
        .iter()
        .enumerate()
        .map(|(i, allocation)| PortReport {
            port_id: allocation.port.id.clone(),
            device_id: allocation.port.device_id.clone(),
            mac_address: allocation.mac.mac().to_string(),
            ip_addresses: allocation.ips.iter().map(|ip| ip.address_readable()).collect(),
            released: i < args.release,
        })
        .collect();

    Ok(Report {
        network: network.id.clone(),
        strategy: strategy.to_string(),
        tenant_id: tenant_id.to_string(),
        ports,
    })
}
