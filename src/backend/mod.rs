//! Collaborator seams for the cluster coordinator
//!
//! Everything the allocation core needs from the rest of the controller is
//! expressed as a trait here: configuration records, accounts, the logical
//! network registry, the public address registry, remote command dispatch and
//! the audit event sink. In-memory implementations live in [`memory`],
//! [`dispatch`] and [`events`].

pub mod dispatch;
pub mod events;
pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cluster::vlan::{VlanBounds, VlanTag};

pub use dispatch::{ChannelDispatcher, DispatchedCommand};
pub use events::{AuditEvent, EventKind, EventLevel, RecordingEventSink, TracingEventSink};
pub use memory::{
    InMemoryAccounts, InMemoryAddressRegistry, InMemoryNetworkRegistry, StaticConfigurationSource,
};

/// Errors surfaced by record stores and registries
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Errors from the remote command dispatch facility
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Dispatch queue closed, dropping command for cluster '{0}'")]
    Closed(String),
}

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// An account as known to the account directory
///
/// Account names are unique, so equality and hashing use the name only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Account {}

impl Hash for Account {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Account[ID={}, name={}]", self.id, self.name)
    }
}

/// A cluster configuration record as seen by the VLAN range derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub name: String,
    #[serde(flatten)]
    pub vlans: VlanBounds,
}

impl ClusterConfiguration {
    pub fn new(name: impl Into<String>, vlans: VlanBounds) -> Self {
        Self {
            name: name.into(),
            vlans,
        }
    }
}

/// A named logical network and the tokens currently referencing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalNetwork {
    pub name: String,
    pub account: Account,
    pub uuid: String,
    /// Assigned VLAN; `None` or tag 0 means the network still needs one
    pub vlan: Option<VlanTag>,
    #[serde(default)]
    pub tokens: BTreeSet<Uuid>,
}

impl LogicalNetwork {
    pub fn new(account: Account, name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            account,
            uuid: uuid.into(),
            vlan: None,
            tokens: BTreeSet::new(),
        }
    }

    /// The network's VLAN, if one has been assigned
    pub fn assigned_vlan(&self) -> Option<VlanTag> {
        self.vlan.filter(|tag| !tag.is_unset())
    }

    pub fn has_tokens(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// Result of trying to bind a freshly drawn VLAN to a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanInit {
    /// The network now carries the offered tag
    Initialized,
    /// Another reservation assigned this tag first; the offered tag was not used
    AlreadyAssigned(VlanTag),
    /// The registry refused the tag (network gone or not assignable)
    Rejected,
}

/// Result of detaching a token from its network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDetach {
    NetworkMissing,
    NotMember,
    Detached { remaining: usize },
}

/// A public address as tracked by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address: IpAddr,
    /// Instance the address is assigned to, if any
    #[serde(default)]
    pub instance_ip: Option<IpAddr>,
    #[serde(default)]
    pub system_owned: bool,
}

impl AddressRecord {
    pub fn is_assigned(&self) -> bool {
        self.instance_ip.is_some()
    }
}

/// Commands sent to a cluster agent through the dispatch subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ClusterCommand {
    #[serde(rename_all = "camelCase")]
    UnassignAddress {
        public_ip: IpAddr,
        instance_ip: Option<IpAddr>,
    },
}

// ============================================================================
// SBIO: Traits for abstraction (allows in-memory and mock backends)
// ============================================================================

/// Source of cluster configuration records carrying VLAN bounds
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    async fn cluster_configurations(&self) -> Result<Vec<ClusterConfiguration>, RegistryError>;
}

/// Account lookup by id
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn lookup_account(&self, id: &str) -> Result<Option<Account>, RegistryError>;
}

/// Registry of named logical networks
///
/// Networks are scoped per cluster: the VLAN recorded on `web` in one cluster
/// was drawn from that cluster's pool and means nothing to another cluster's
/// `web`. Implementations must make each call atomic with respect to the
/// (cluster, name) pair; the allocator relies on `init_vlan` being a
/// compare-and-set and on `remove_if_unused` only removing a network whose
/// token set is empty.
#[async_trait]
pub trait NetworkRegistry: Send + Sync {
    async fn lookup_network(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<LogicalNetwork>, RegistryError>;

    async fn init_vlan(
        &self,
        cluster: &str,
        name: &str,
        vlan: VlanTag,
    ) -> Result<VlanInit, RegistryError>;

    /// Record a token against the network; `false` when the network is gone
    async fn attach_token(
        &self,
        cluster: &str,
        name: &str,
        token: Uuid,
    ) -> Result<bool, RegistryError>;

    async fn detach_token(
        &self,
        cluster: &str,
        name: &str,
        token: Uuid,
    ) -> Result<TokenDetach, RegistryError>;

    async fn remove_if_unused(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<LogicalNetwork>, RegistryError>;
}

/// Registry of public addresses
#[async_trait]
pub trait AddressRegistry: Send + Sync {
    async fn lookup_address(&self, address: IpAddr) -> Result<Option<AddressRecord>, RegistryError>;

    /// Release a system-owned address back to the public pool
    async fn release_address(&self, address: IpAddr) -> Result<(), RegistryError>;
}

/// Fire-and-forget command dispatch to a named cluster
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, cluster: &str, command: ClusterCommand) -> Result<(), DispatchError>;
}

/// Sink for leveled audit events
pub trait EventSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// The collaborators shared by every cluster state in a process
#[derive(Clone)]
pub struct Collaborators {
    pub configurations: Arc<dyn ConfigurationSource>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub networks: Arc<dyn NetworkRegistry>,
    pub addresses: Arc<dyn AddressRegistry>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub events: Arc<dyn EventSink>,
}
