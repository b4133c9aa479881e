use crate::config::Config;
use crate::models::{ip_to_int, MacAddressRange, Subnet};
use crate::policy::IpPolicy;
use crate::store::MemoryStore;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{info, warn};
use std::fs::File;
use std::path::Path;

/// Load and parse configuration from a YAML file
pub fn load_config(config_path: &Path) -> Result<Config> {
    info!("Loading configuration from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open config file {:?}", config_path))?;

    let config: Config = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse config file {:?}", config_path))?;

    config.validate()?;

    for network in &config.networks {
        if let Some(name) = &network.ipam_strategy {
            if !crate::ipam::registry::STRATEGY_NAMES.contains(&name.as_str()) {
                warn!(
                    "Network {} names unknown IPAM strategy {}, {} will be used",
                    network.id, name, config.ipam.default_strategy
                );
            }
        }
    }

    Ok(config)
}

/// Totals provisioned by [`seed_store`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub mac_ranges: usize,
    pub subnets: usize,
}

/// Provision the configured pools into `store`
pub fn seed_store(config: &Config, store: &MemoryStore) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    for range_config in &config.mac_ranges {
        let mut range = MacAddressRange::new(range_config.first_address, range_config.last_address);
        if let Some(next) = range_config.next_auto_assign_mac {
            range.next_auto_assign_mac = next.value();
        }
        store
            .add_mac_range(range)
            .wrap_err("Failed to seed MAC range")?;
        summary.mac_ranges += 1;
    }

    for subnet_config in &config.subnets {
        let mut subnet = Subnet::new(&subnet_config.network_id, subnet_config.cidr);
        if let Some(segment) = &subnet_config.segment_id {
            subnet = subnet.with_segment(segment);
        }
        if let Some(next) = subnet_config.next_auto_assign_ip {
            subnet.next_auto_assign_ip = ip_to_int(next);
        }
        if !subnet_config.exclude.is_empty() {
            subnet = subnet.with_policy(IpPolicy::new(subnet_config.exclude.clone()));
        }
        info!("Seeding subnet {} on network {}", subnet.cidr, subnet.network_id);
        store
            .add_subnet(subnet)
            .wrap_err_with(|| format!("Failed to seed subnet {}", subnet_config.cidr))?;
        summary.subnets += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AddressStore, LockMode, StoreTransaction, SubnetFilter};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
ipam:
  default_strategy: BOTH
  reuse_after: 10m
  tenant_id: acme
networks:
  - id: net-1
    ipam_strategy: BOTH_REQUIRED
  - id: net-2
    shared: true
mac_ranges:
  - first_address: "02:00:00:00:00:00"
    last_address: "02:00:00:00:0f:ff"
    next_auto_assign_mac: "02:00:00:00:00:10"
subnets:
  - network_id: net-1
    cidr: 10.0.0.0/24
    exclude: [10.0.0.0/32, 10.0.0.255/32]
  - network_id: net-1
    cidr: fd00::/64
  - network_id: net-2
    cidr: 192.168.10.0/24
    segment_id: seg-a
    next_auto_assign_ip: 192.168.10.50
"#;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();
        temp_file
    }

    #[test]
    fn test_load_config() {
        let temp_file = write_config(YAML);
        let config = load_config(temp_file.path()).unwrap();

        assert_eq!(config.ipam.default_strategy, "BOTH");
        assert_eq!(config.ipam.reuse_after.as_secs(), 600);
        assert_eq!(config.ipam.tenant_id, "acme");
        assert!(config.network("net-2").unwrap().shared);
        assert_eq!(config.subnets.len(), 3);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let temp_file = write_config("subnets:\n  - network_id: nope\n    cidr: 10.0.0.0/8\n");
        assert!(load_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/netipam.yaml")).unwrap_err();
        assert!(format!("{}", err).contains("Failed to open config file"));
    }

    #[test]
    fn test_seed_store() {
        let temp_file = write_config(YAML);
        let config = load_config(temp_file.path()).unwrap();
        let store = MemoryStore::new();

        let summary = seed_store(&config, &store).unwrap();
        assert_eq!(summary, SeedSummary { mac_ranges: 1, subnets: 3 });

        let filter = SubnetFilter {
            segment_id: Some("seg-a".to_string()),
            ..Default::default()
        };
        let mut tx = store.begin().unwrap();
        let subnets = tx.find_subnets(&filter, LockMode::None).unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(
            subnets[0].0.next_auto_assign_ip,
            ip_to_int("192.168.10.50".parse().unwrap())
        );
    }
}
