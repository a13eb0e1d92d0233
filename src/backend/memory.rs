//! In-memory collaborator implementations
//!
//! Used by the standalone binary (seeded from the coordinator config file) and
//! by tests. Each registry is a `DashMap`, so every trait call is atomic with
//! respect to the record it touches.

use std::net::IpAddr;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{
    Account, AccountDirectory, AddressRecord, AddressRegistry, ClusterConfiguration,
    ConfigurationSource, LogicalNetwork, NetworkRegistry, RegistryError, TokenDetach, VlanInit,
};
use crate::cluster::vlan::{VlanBounds, VlanTag};

// ============================================================================
// Configuration records
// ============================================================================

/// Cluster configuration records whose VLAN bounds can be edited at runtime
#[derive(Debug, Default)]
pub struct StaticConfigurationSource {
    records: DashMap<String, VlanBounds>,
}

impl StaticConfigurationSource {
    pub fn new(records: impl IntoIterator<Item = ClusterConfiguration>) -> Self {
        let source = Self::default();
        for record in records {
            source.records.insert(record.name, record.vlans);
        }
        source
    }

    /// Insert or replace the bounds for a cluster
    pub fn set_bounds(&self, cluster: impl Into<String>, bounds: VlanBounds) {
        self.records.insert(cluster.into(), bounds);
    }

    pub fn remove(&self, cluster: &str) -> Option<VlanBounds> {
        self.records.remove(cluster).map(|(_, b)| b)
    }

    pub fn bounds(&self, cluster: &str) -> Option<VlanBounds> {
        self.records.get(cluster).map(|r| r.clone())
    }
}

#[async_trait]
impl ConfigurationSource for StaticConfigurationSource {
    async fn cluster_configurations(&self) -> Result<Vec<ClusterConfiguration>, RegistryError> {
        let mut records: Vec<ClusterConfiguration> = self
            .records
            .iter()
            .map(|r| ClusterConfiguration::new(r.key().clone(), r.value().clone()))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    accounts: DashMap<String, Account>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccounts {
    async fn lookup_account(&self, id: &str) -> Result<Option<Account>, RegistryError> {
        Ok(self.accounts.get(id).map(|r| r.clone()))
    }
}

// ============================================================================
// Logical networks
// ============================================================================

/// Networks keyed by (cluster, name)
#[derive(Debug, Default)]
pub struct InMemoryNetworkRegistry {
    networks: DashMap<(String, String), LogicalNetwork>,
}

fn network_key(cluster: &str, name: &str) -> (String, String) {
    (cluster.to_string(), name.to_string())
}

impl InMemoryNetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a network in `cluster` that has no VLAN yet
    pub fn define(
        &self,
        cluster: &str,
        account: Account,
        name: impl Into<String>,
    ) -> LogicalNetwork {
        let network = LogicalNetwork::new(account, name, Uuid::new_v4().to_string());
        self.insert(cluster, network.clone());
        network
    }

    pub fn insert(&self, cluster: &str, network: LogicalNetwork) {
        self.networks
            .insert(network_key(cluster, &network.name), network);
    }

    pub fn get(&self, cluster: &str, name: &str) -> Option<LogicalNetwork> {
        self.networks
            .get(&network_key(cluster, name))
            .map(|r| r.clone())
    }

    /// Networks defined in `cluster`, sorted by name
    pub fn list(&self, cluster: &str) -> Vec<LogicalNetwork> {
        let mut networks: Vec<LogicalNetwork> = self
            .networks
            .iter()
            .filter(|r| r.key().0 == cluster)
            .map(|r| r.value().clone())
            .collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[async_trait]
impl NetworkRegistry for InMemoryNetworkRegistry {
    async fn lookup_network(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<LogicalNetwork>, RegistryError> {
        Ok(self.get(cluster, name))
    }

    async fn init_vlan(
        &self,
        cluster: &str,
        name: &str,
        vlan: VlanTag,
    ) -> Result<VlanInit, RegistryError> {
        if vlan.is_unset() {
            return Ok(VlanInit::Rejected);
        }
        let Some(mut network) = self.networks.get_mut(&network_key(cluster, name)) else {
            return Ok(VlanInit::Rejected);
        };
        match network.assigned_vlan() {
            Some(existing) => Ok(VlanInit::AlreadyAssigned(existing)),
            None => {
                network.vlan = Some(vlan);
                Ok(VlanInit::Initialized)
            }
        }
    }

    async fn attach_token(
        &self,
        cluster: &str,
        name: &str,
        token: Uuid,
    ) -> Result<bool, RegistryError> {
        match self.networks.get_mut(&network_key(cluster, name)) {
            Some(mut network) => {
                network.tokens.insert(token);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn detach_token(
        &self,
        cluster: &str,
        name: &str,
        token: Uuid,
    ) -> Result<TokenDetach, RegistryError> {
        let Some(mut network) = self.networks.get_mut(&network_key(cluster, name)) else {
            return Ok(TokenDetach::NetworkMissing);
        };
        if !network.tokens.remove(&token) {
            return Ok(TokenDetach::NotMember);
        }
        Ok(TokenDetach::Detached {
            remaining: network.tokens.len(),
        })
    }

    async fn remove_if_unused(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<LogicalNetwork>, RegistryError> {
        Ok(self
            .networks
            .remove_if(&network_key(cluster, name), |_, network| {
                !network.has_tokens()
            })
            .map(|(_, network)| network))
    }
}

// ============================================================================
// Public addresses
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryAddressRegistry {
    addresses: DashMap<IpAddr, AddressRecord>,
}

impl InMemoryAddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: AddressRecord) {
        self.addresses.insert(record.address, record);
    }

    pub fn get(&self, address: IpAddr) -> Option<AddressRecord> {
        self.addresses.get(&address).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[async_trait]
impl AddressRegistry for InMemoryAddressRegistry {
    async fn lookup_address(&self, address: IpAddr) -> Result<Option<AddressRecord>, RegistryError> {
        Ok(self.get(address))
    }

    async fn release_address(&self, address: IpAddr) -> Result<(), RegistryError> {
        match self.addresses.entry(address) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.system_owned = false;
                record.instance_ip = None;
                debug!("Released public address {}", address);
                Ok(())
            }
            Entry::Vacant(_) => Err(RegistryError::InvalidRecord(format!(
                "address {} is not registered",
                address
            ))),
        }
    }
}
