//! tunnelgrid.toml configuration parser.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_EDGE_LABEL;
use crate::endpoint::is_dns_name;
use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Prefix of every endpoint name owned by this control plane.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default)]
    pub edge: EdgeConfig,
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub certs: CertsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Pools edge pod subnets are carved from, at most one per address family.
    #[serde(default)]
    pub pod_cidrs: Vec<String>,
    #[serde(default = "default_block_prefix_v4")]
    pub block_prefix_v4: u8,
    #[serde(default = "default_block_prefix_v6")]
    pub block_prefix_v6: u8,
    /// Allocate pod subnets from `pod_cidrs`; when false, trust the
    /// pod CIDRs reported by the node itself.
    #[serde(default = "default_true")]
    pub allocate_pod_cidrs: bool,
    /// `{node}` is replaced by the endpoint name.
    #[serde(default = "default_endpoint_id_format")]
    pub endpoint_id_format: String,
    /// Labels a node must carry (key and value) to be treated as an edge node.
    /// An empty value matches any value.
    #[serde(default = "default_edge_labels")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_connector_name")]
    pub name: String,
    pub public_addresses: Vec<String>,
    /// Extra subnets the connector routes besides cloud-node pod CIDRs.
    #[serde(default)]
    pub provided_subnets: Vec<String>,
    #[serde(default = "default_connector_config_name")]
    pub config_name: String,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Workload recreated when the connector credential is renewed.
    #[serde(default)]
    pub workload_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_image")]
    pub image: String,
    #[serde(default = "default_strongswan_image")]
    pub strongswan_image: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertsConfig {
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    /// PEM files of an existing CA. A fresh CA is generated when unset.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub ca_key_file: Option<PathBuf>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            pod_cidrs: Vec::new(),
            block_prefix_v4: default_block_prefix_v4(),
            block_prefix_v6: default_block_prefix_v6(),
            allocate_pod_cidrs: true,
            endpoint_id_format: default_endpoint_id_format(),
            labels: default_edge_labels(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            image: default_agent_image(),
            strongswan_image: default_strongswan_image(),
            args: BTreeMap::new(),
        }
    }
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            organization: default_organization(),
            validity_days: default_validity_days(),
            ca_cert_file: None,
            ca_key_file: None,
        }
    }
}

impl OperatorConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: OperatorConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject configurations the control plane cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cluster_name.is_empty() {
            return Err(invalid("cluster_name must not be empty"));
        }

        let name = &self.connector.name;
        if !is_dns_label(name) {
            return Err(invalid(format!("invalid connector name {name:?}")));
        }
        if self.connector.config_name.is_empty() {
            return Err(invalid("connector config_name must not be empty"));
        }
        if self.connector.public_addresses.is_empty() {
            return Err(invalid("connector public_addresses are required"));
        }
        for addr in &self.connector.public_addresses {
            if addr.parse::<IpAddr>().is_err() && !is_dns_name(addr) {
                return Err(invalid(format!("invalid connector public address {addr:?}")));
            }
        }
        for subnet in &self.connector.provided_subnets {
            parse_cidr(subnet)?;
        }
        if self.connector.sync_interval_secs == 0 {
            return Err(invalid("connector sync_interval_secs must be positive"));
        }

        if self.edge.allocate_pod_cidrs && self.edge.pod_cidrs.is_empty() {
            return Err(invalid("edge pod_cidrs are required when allocate_pod_cidrs is set"));
        }
        let mut families = Vec::new();
        for cidr in &self.edge.pod_cidrs {
            let pool = parse_cidr(cidr)?;
            let (prefix, max) = match pool {
                IpNet::V4(_) => (self.edge.block_prefix_v4, 32),
                IpNet::V6(_) => (self.edge.block_prefix_v6, 128),
            };
            if prefix <= pool.prefix_len() || prefix > max {
                return Err(invalid(format!(
                    "block prefix /{prefix} is not valid for pool {cidr}"
                )));
            }
            let v4 = matches!(pool, IpNet::V4(_));
            if families.contains(&v4) {
                return Err(invalid("at most one edge pod CIDR per address family"));
            }
            families.push(v4);
        }

        if self.certs.validity_days == 0 {
            return Err(invalid("certs validity_days must be positive"));
        }
        if self.certs.ca_cert_file.is_some() != self.certs.ca_key_file.is_some() {
            return Err(invalid("certs ca_cert_file and ca_key_file must be set together"));
        }

        Ok(())
    }

    pub fn connector_sync_interval(&self) -> Duration {
        Duration::from_secs(self.connector.sync_interval_secs)
    }

    /// Block prefix length used for a pool of the given family.
    pub fn block_prefix_for(&self, pool: &IpNet) -> u8 {
        match pool {
            IpNet::V4(_) => self.edge.block_prefix_v4,
            IpNet::V6(_) => self.edge.block_prefix_v6,
        }
    }

    /// Render a minimal configuration for `check-config` style scaffolding.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }
}

fn parse_cidr(cidr: &str) -> ConfigResult<IpNet> {
    cidr.parse::<IpNet>()
        .map_err(|_| invalid(format!("invalid CIDR {cidr:?}")))
}

fn is_dns_label(name: &str) -> bool {
    name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn default_namespace() -> String {
    "tunnelgrid".to_string()
}

fn default_cluster_name() -> String {
    "tunnelgrid".to_string()
}

fn default_edge_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(DEFAULT_EDGE_LABEL.to_string(), String::new())])
}

fn default_block_prefix_v4() -> u8 {
    26
}

fn default_block_prefix_v6() -> u8 {
    120
}

fn default_true() -> bool {
    true
}

fn default_endpoint_id_format() -> String {
    "C=CN, O=tunnelgrid, CN={node}".to_string()
}

fn default_connector_name() -> String {
    "cloud-connector".to_string()
}

fn default_connector_config_name() -> String {
    "cloud-tunnels-config".to_string()
}

fn default_sync_interval_secs() -> u64 {
    5
}

fn default_agent_image() -> String {
    "tunnelgrid/agent:latest".to_string()
}

fn default_strongswan_image() -> String {
    "tunnelgrid/strongswan:5.9".to_string()
}

fn default_organization() -> String {
    "tunnelgrid".to_string()
}

fn default_validity_days() -> u32 {
    365
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[edge]
pod_cidrs = ["2.2.0.0/16"]

[connector]
public_addresses = ["192.168.1.1"]
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.namespace, "tunnelgrid");
        assert_eq!(config.connector.name, "cloud-connector");
        assert_eq!(config.connector.config_name, "cloud-tunnels-config");
        assert_eq!(config.connector_sync_interval(), Duration::from_secs(5));
        assert_eq!(config.edge.block_prefix_v4, 26);
        assert!(config.edge.allocate_pod_cidrs);
        assert!(config.edge.labels.contains_key(DEFAULT_EDGE_LABEL));
        config.validate().unwrap();
    }

    #[test]
    fn missing_connector_section_fails_to_parse() {
        let result = OperatorConfig::from_toml_str("[edge]\npod_cidrs = []\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_empty_public_addresses() {
        let mut config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        config.connector.public_addresses.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_connector_name() {
        let mut config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        config.connector.name = "Cloud_Connector".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_block_prefix_not_more_specific_than_pool() {
        let mut config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        config.edge.block_prefix_v4 = 16;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn accepts_dual_stack_but_not_two_pools_of_one_family() {
        let mut config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        config.edge.pod_cidrs.push("fd85:ee78:d8a6:8607::/64".to_string());
        config.validate().unwrap();

        config.edge.pod_cidrs.push("3.3.0.0/16".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn raw_mode_needs_no_pools() {
        let mut config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        config.edge.pod_cidrs.clear();
        assert!(config.validate().is_err());

        config.edge.allocate_pod_cidrs = false;
        config.validate().unwrap();
    }

    #[test]
    fn ca_files_come_in_pairs() {
        let mut config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        config.certs.ca_cert_file = Some(PathBuf::from("/etc/tunnelgrid/ca.crt"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.certs.ca_key_file = Some(PathBuf::from("/etc/tunnelgrid/ca.key"));
        config.validate().unwrap();
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnelgrid.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = OperatorConfig::from_file(&path).unwrap();
        assert_eq!(config.edge.pod_cidrs, vec!["2.2.0.0/16".to_string()]);

        let missing = OperatorConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = OperatorConfig::from_toml_str(MINIMAL).unwrap();
        let text = config.to_toml_string().unwrap();
        let again = OperatorConfig::from_toml_str(&text).unwrap();
        assert_eq!(again.connector.public_addresses, config.connector.public_addresses);
    }
}
