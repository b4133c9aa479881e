use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;

use crate::ipam::registry::STRATEGY_NAMES;
use crate::models::MacAddr;
use crate::policy::IpPolicy;
use crate::ports::Network;

/// Address pools and engine settings, as read from YAML
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ipam: IpamConfig,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub mac_ranges: Vec<MacRangeConfig>,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !STRATEGY_NAMES.contains(&self.ipam.default_strategy.as_str()) {
            return Err(ValidationError::InvalidIpam(format!(
                "unknown default_strategy {:?}, expected one of {:?}",
                self.ipam.default_strategy, STRATEGY_NAMES
            )));
        }
        if self.ipam.tenant_id.is_empty() {
            return Err(ValidationError::InvalidIpam(
                "tenant_id cannot be empty".to_string(),
            ));
        }

        let mut network_ids = HashSet::new();
        for network in &self.networks {
            if network.id.is_empty() {
                return Err(ValidationError::InvalidNetwork(
                    "Network id cannot be empty".to_string(),
                ));
            }
            if !network_ids.insert(network.id.as_str()) {
                return Err(ValidationError::InvalidNetwork(format!(
                    "Network {} declared more than once",
                    network.id
                )));
            }
        }

        for range in &self.mac_ranges {
            range.validate()?;
        }

        for subnet in &self.subnets {
            if !network_ids.contains(subnet.network_id.as_str()) {
                return Err(ValidationError::InvalidSubnet(format!(
                    "Subnet {} references undeclared network {}",
                    subnet.cidr, subnet.network_id
                )));
            }
            subnet.validate()?;
        }

        Ok(())
    }

    pub fn network(&self, id: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.id == id)
    }
}

/// Engine-wide settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IpamConfig {
    /// Strategy for networks that name none, or an unknown one
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
    /// How long a released address sits before it may be handed out again
    #[serde(default = "default_reuse_after", with = "humantime_serde")]
    pub reuse_after: Duration,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_strategy() -> String {
    "ANY".to_string()
}

fn default_reuse_after() -> Duration {
    Duration::from_secs(300)
}

fn default_tenant() -> String {
    "default".to_string()
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            reuse_after: default_reuse_after(),
            tenant_id: default_tenant(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MacRangeConfig {
    pub first_address: MacAddr,
    pub last_address: MacAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_auto_assign_mac: Option<MacAddr>,
}

impl MacRangeConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let (first, last) = (self.first_address, self.last_address);
        if first > last {
            return Err(ValidationError::InvalidMacRange(format!(
                "first_address {} is above last_address {}",
                first, last
            )));
        }
        // One past the end marks a fully walked range
        if let Some(next) = self.next_auto_assign_mac {
            if next < first || next.value() > last.value() + 1 {
                return Err(ValidationError::InvalidMacRange(format!(
                    "next_auto_assign_mac {} is outside {}-{}",
                    next, first, last
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubnetConfig {
    pub network_id: String,
    pub cidr: IpNet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_auto_assign_ip: Option<IpAddr>,
    /// Blocks withheld from allocation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<IpNet>,
}

impl SubnetConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let cidr = self.cidr.trunc();
        let policy = IpPolicy::new(self.exclude.clone());
        if let Some(outside) = policy.outside_of(&cidr).first() {
            return Err(ValidationError::InvalidSubnet(format!(
                "exclusion {} is not inside {}",
                outside, cidr
            )));
        }
        if let Some(next) = self.next_auto_assign_ip {
            if !cidr.contains(&next) {
                return Err(ValidationError::InvalidSubnet(format!(
                    "next_auto_assign_ip {} is not inside {}",
                    next, cidr
                )));
            }
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid ipam configuration: {0}")]
    InvalidIpam(String),
    #[error("Invalid network configuration: {0}")]
    InvalidNetwork(String),
    #[error("Invalid MAC range configuration: {0}")]
    InvalidMacRange(String),
    #[error("Invalid subnet configuration: {0}")]
    InvalidSubnet(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    const BASE: &str = r#"
networks:
  - id: net-1
mac_ranges:
  - first_address: "02:00:00:00:00:00"
    last_address: "02:00:00:00:00:ff"
subnets:
  - network_id: net-1
    cidr: 10.0.0.0/24
    exclude: [10.0.0.0/30]
"#;

    #[test]
    fn test_defaults() {
        let config = parse(BASE);
        assert_eq!(config.ipam.default_strategy, "ANY");
        assert_eq!(config.ipam.reuse_after, Duration::from_secs(300));
        assert_eq!(config.ipam.tenant_id, "default");
        assert!(!config.networks[0].shared);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_humantime_reuse_after() {
        let config = parse("ipam:\n  reuse_after: 90s\n  default_strategy: BOTH\n");
        assert_eq!(config.ipam.reuse_after, Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_default_strategy() {
        let config = parse("ipam:\n  default_strategy: RANDOM\n");
        assert!(matches!(config.validate(), Err(ValidationError::InvalidIpam(_))));
    }

    #[test]
    fn test_subnet_on_undeclared_network() {
        let config = parse("subnets:\n  - network_id: ghost\n    cidr: 10.0.0.0/24\n");
        assert!(matches!(config.validate(), Err(ValidationError::InvalidSubnet(_))));
    }

    #[test]
    fn test_exclusion_outside_cidr() {
        let mut config = parse(BASE);
        config.subnets[0].exclude.push("10.9.0.0/30".parse().unwrap());
        assert!(matches!(config.validate(), Err(ValidationError::InvalidSubnet(_))));
    }

    #[test]
    fn test_inverted_mac_range() {
        let mut config = parse(BASE);
        let range = &mut config.mac_ranges[0];
        std::mem::swap(&mut range.first_address, &mut range.last_address);
        assert!(matches!(config.validate(), Err(ValidationError::InvalidMacRange(_))));
    }

    #[test]
    fn test_mac_cursor_bounds() {
        let mut config = parse(BASE);
        config.mac_ranges[0].next_auto_assign_mac = Some("02:00:00:00:01:00".parse().unwrap());
        assert!(config.validate().is_ok());
        config.mac_ranges[0].next_auto_assign_mac = Some("02:00:00:00:01:01".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_network() {
        let config = parse("networks:\n  - id: a\n  - id: a\n");
        assert!(matches!(config.validate(), Err(ValidationError::InvalidNetwork(_))));
    }
}
