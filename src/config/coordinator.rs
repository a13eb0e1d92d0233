use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{
    Account, AddressRecord, ClusterConfiguration, InMemoryAccounts, InMemoryAddressRegistry,
    InMemoryNetworkRegistry, LogicalNetwork, StaticConfigurationSource,
};
use crate::cluster::{
    derive_range, ClusterRegistry, ClusterSettings, VlanBounds, VlanRange, DEFAULT_MAX_VLAN,
    DEFAULT_REDERIVE_INTERVAL_SECS,
};

/// Errors that can occur during coordinator config parsing and validation
#[derive(Error, Debug, PartialEq)]
pub enum CoordinatorConfigError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Cluster name must not be empty")]
    EmptyClusterName,

    #[error("Duplicate cluster name: '{0}'")]
    DuplicateCluster(String),

    #[error("Cluster '{cluster}': min_vlan {min} must be below max_vlan {max}")]
    InvertedVlanBounds { cluster: String, min: u16, max: u16 },

    #[error("Cluster '{cluster}': vlan {value} is outside [1, 4095]")]
    VlanOutOfRange { cluster: String, value: u16 },

    #[error("Duplicate account id: '{0}'")]
    DuplicateAccount(String),

    #[error("Duplicate network name: '{0}'")]
    DuplicateNetwork(String),

    #[error("Cluster '{cluster}' referenced by network '{network}' is not defined")]
    UndefinedCluster { cluster: String, network: String },

    #[error("Account '{account}' referenced by {owner} is not defined")]
    UndefinedAccount { account: String, owner: String },

    #[error("Re-derive interval must be at least one second")]
    ZeroInterval,
}

/// A cluster and its operator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterEntry {
    pub name: String,
    #[serde(default)]
    pub min_vlan: Option<u16>,
    #[serde(default)]
    pub max_vlan: Option<u16>,
    #[serde(default = "default_mode")]
    pub mode: u32,
    #[serde(default)]
    pub public_addressing: bool,
    #[serde(default)]
    pub address_capacity: Option<u32>,
}

fn default_mode() -> u32 {
    1
}

impl ClusterEntry {
    pub fn bounds(&self) -> VlanBounds {
        VlanBounds::new(self.min_vlan, self.max_vlan)
    }

    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            mode: self.mode,
            address_capacity: self.address_capacity,
            public_addressing: self.public_addressing,
            addressing_initialized: false,
        }
    }
}

/// A logical network known before startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkEntry {
    pub name: String,
    pub account_id: String,
    /// Generated when omitted
    #[serde(default)]
    pub uuid: Option<String>,
    /// Cluster the network lives in; every configured cluster when omitted
    #[serde(default)]
    pub cluster: Option<String>,
}

/// A public address and its assignment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddressEntry {
    pub address: IpAddr,
    #[serde(default)]
    pub instance_ip: Option<IpAddr>,
    #[serde(default)]
    pub system_owned: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    #[serde(default = "default_rederive_interval")]
    pub rederive_interval_secs: u64,
}

fn default_rederive_interval() -> u64 {
    DEFAULT_REDERIVE_INTERVAL_SECS
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rederive_interval_secs: DEFAULT_REDERIVE_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// The complete coordinator config file structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub networks: Vec<NetworkEntry>,
    #[serde(default)]
    pub addresses: Vec<AddressEntry>,
    #[serde(default)]
    pub drivers: DriverConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Parse a coordinator config; content starting with `{` is JSON, anything
/// else is YAML.
pub fn parse_config(content: &str) -> Result<CoordinatorConfig, CoordinatorConfigError> {
    if content.trim_start().starts_with('{') {
        serde_json::from_str(content).map_err(|e| CoordinatorConfigError::ParseError(e.to_string()))
    } else {
        serde_yaml::from_str(content).map_err(|e| CoordinatorConfigError::ParseError(e.to_string()))
    }
}

/// Validate a config for consistency.
/// This is a pure function - no I/O.
pub fn validate_config(config: &CoordinatorConfig) -> Result<(), CoordinatorConfigError> {
    let mut clusters = HashSet::new();
    for cluster in &config.clusters {
        if cluster.name.trim().is_empty() {
            return Err(CoordinatorConfigError::EmptyClusterName);
        }
        if !clusters.insert(cluster.name.as_str()) {
            return Err(CoordinatorConfigError::DuplicateCluster(cluster.name.clone()));
        }
        for value in [cluster.min_vlan, cluster.max_vlan].into_iter().flatten() {
            if value == 0 || value > DEFAULT_MAX_VLAN {
                return Err(CoordinatorConfigError::VlanOutOfRange {
                    cluster: cluster.name.clone(),
                    value,
                });
            }
        }
        if let (Some(min), Some(max)) = (cluster.min_vlan, cluster.max_vlan) {
            if min >= max {
                return Err(CoordinatorConfigError::InvertedVlanBounds {
                    cluster: cluster.name.clone(),
                    min,
                    max,
                });
            }
        }
    }

    let mut accounts = HashSet::new();
    for account in &config.accounts {
        if !accounts.insert(account.id.as_str()) {
            return Err(CoordinatorConfigError::DuplicateAccount(account.id.clone()));
        }
    }

    let mut networks = HashSet::new();
    for network in &config.networks {
        if !networks.insert(network.name.as_str()) {
            return Err(CoordinatorConfigError::DuplicateNetwork(network.name.clone()));
        }
        if let Some(cluster) = &network.cluster {
            if !clusters.contains(cluster.as_str()) {
                return Err(CoordinatorConfigError::UndefinedCluster {
                    cluster: cluster.clone(),
                    network: network.name.clone(),
                });
            }
        }
        if !accounts.contains(network.account_id.as_str()) {
            return Err(CoordinatorConfigError::UndefinedAccount {
                account: network.account_id.clone(),
                owner: format!("network '{}'", network.name),
            });
        }
    }

    if config.drivers.rederive_interval_secs == 0 {
        return Err(CoordinatorConfigError::ZeroInterval);
    }

    Ok(())
}

/// In-memory backends seeded from a config
pub struct SeededBackends {
    pub configurations: Arc<StaticConfigurationSource>,
    pub accounts: Arc<InMemoryAccounts>,
    pub networks: Arc<InMemoryNetworkRegistry>,
    pub addresses: Arc<InMemoryAddressRegistry>,
}

impl CoordinatorConfig {
    /// Parse and validate in one step
    pub fn from_str(content: &str) -> Result<Self, CoordinatorConfigError> {
        let config = parse_config(content)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// The range every cluster pool converges to on its first re-derivation
    pub fn derived_range(&self) -> VlanRange {
        let bounds: Vec<VlanBounds> = self.clusters.iter().map(|c| c.bounds()).collect();
        derive_range(&bounds)
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterEntry> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Build the in-memory backends described by this config
    pub fn seed_backends(&self) -> SeededBackends {
        let configurations = Arc::new(StaticConfigurationSource::new(
            self.clusters
                .iter()
                .map(|c| ClusterConfiguration::new(&c.name, c.bounds())),
        ));

        let accounts = Arc::new(InMemoryAccounts::new());
        for account in &self.accounts {
            accounts.insert(account.clone());
        }

        let networks = Arc::new(InMemoryNetworkRegistry::new());
        for entry in &self.networks {
            let Some(account) = self.accounts.iter().find(|a| a.id == entry.account_id) else {
                continue;
            };
            let uuid = entry
                .uuid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let network = LogicalNetwork::new(account.clone(), &entry.name, uuid);
            for cluster in self.clusters.iter().map(|c| c.name.as_str()) {
                if entry.cluster.as_deref().is_some_and(|c| c != cluster) {
                    continue;
                }
                networks.insert(cluster, network.clone());
            }
        }

        let addresses = Arc::new(InMemoryAddressRegistry::new());
        for entry in &self.addresses {
            addresses.insert(AddressRecord {
                address: entry.address,
                instance_ip: entry.instance_ip,
                system_owned: entry.system_owned,
            });
        }

        SeededBackends {
            configurations,
            accounts,
            networks,
            addresses,
        }
    }

    /// Create a cluster state for every configured cluster
    pub fn register_clusters(&self, registry: &ClusterRegistry) {
        for entry in &self.clusters {
            registry.get_or_create(&entry.name).apply_settings(entry.settings());
        }
    }
}
