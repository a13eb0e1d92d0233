//! Per-cluster state: the composition root for one cluster
//!
//! A `ClusterState` owns its VLAN pool and orphan tracker for the lifetime of
//! the cluster. Identity is the cluster name alone.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::allocator::{AllocationError, NetworkTokenAllocator, ReleaseOutcome};
use super::orphan::{
    ClusterAddress, OrphanAddressTracker, OrphanObservation, OrphanPolicy, OrphanState,
};
use super::token::NetworkToken;
use super::vlan::{PoolSnapshot, VlanPool, VlanRange, VlanTag};
use crate::backend::{Account, Collaborators};

/// Operator-visible cluster attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSettings {
    pub mode: u32,
    #[serde(default)]
    pub address_capacity: Option<u32>,
    #[serde(default)]
    pub public_addressing: bool,
    #[serde(default)]
    pub addressing_initialized: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            mode: 1,
            address_capacity: None,
            public_addressing: false,
            addressing_initialized: false,
        }
    }
}

/// Tally of one address report reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Addresses accounted for by the address registry
    pub cleared: usize,
    pub observed: usize,
    pub remediated: usize,
    /// Addresses skipped because the lookup failed
    pub failed: usize,
}

/// Status view of a cluster
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub settings: ClusterSettings,
    pub vlan_range: VlanRange,
    pub vlans_available: usize,
    pub vlans_assigned: usize,
    pub orphans: usize,
}

pub struct ClusterState {
    name: String,
    pool: Arc<VlanPool>,
    allocator: NetworkTokenAllocator,
    orphans: OrphanAddressTracker,
    collaborators: Collaborators,
    settings: RwLock<ClusterSettings>,
}

impl ClusterState {
    pub fn new(name: impl Into<String>, collaborators: Collaborators) -> Self {
        Self::with_policy(name, collaborators, OrphanPolicy::default())
    }

    /// Create a cluster state whose pool starts with the full default range
    pub fn with_policy(
        name: impl Into<String>,
        collaborators: Collaborators,
        policy: OrphanPolicy,
    ) -> Self {
        let name = name.into();
        let pool = Arc::new(VlanPool::default());
        Self {
            allocator: NetworkTokenAllocator::new(&name, pool.clone(), collaborators.clone()),
            orphans: OrphanAddressTracker::new(&name, policy, collaborators.clone()),
            pool,
            collaborators,
            settings: RwLock::new(ClusterSettings::default()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // VLAN pool
    // =========================================================================

    /// Re-derive the VLAN range from live configuration
    pub async fn rederive(&self) -> VlanRange {
        self.allocator.rederive().await
    }

    /// Draw the lowest free tag directly from the pool
    pub fn take_vlan(&self) -> Option<VlanTag> {
        self.pool.take()
    }

    pub fn return_vlan(&self, tag: VlanTag) -> bool {
        self.pool.give_back(tag)
    }

    pub fn vlan_pool(&self) -> &VlanPool {
        &self.pool
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    // =========================================================================
    // Network tokens
    // =========================================================================

    pub async fn reserve(
        &self,
        owner: &Account,
        network_name: &str,
    ) -> Result<NetworkToken, AllocationError> {
        self.allocator.reserve(owner, network_name).await
    }

    pub async fn reserve_existing(
        &self,
        account_id: &str,
        network_name: &str,
        network_uuid: &str,
        vlan: VlanTag,
    ) -> Result<NetworkToken, AllocationError> {
        self.allocator
            .reserve_existing(account_id, network_name, network_uuid, vlan)
            .await
    }

    pub async fn release(&self, token: &NetworkToken) -> Result<ReleaseOutcome, AllocationError> {
        self.allocator.release(token).await
    }

    // =========================================================================
    // Orphaned addresses
    // =========================================================================

    pub async fn observe_orphan(&self, address: ClusterAddress) -> OrphanObservation {
        self.orphans.observe(address).await
    }

    pub fn clear_orphan(&self, address: &ClusterAddress) -> Option<OrphanState> {
        self.orphans.clear(address)
    }

    pub fn orphans(&self) -> &OrphanAddressTracker {
        &self.orphans
    }

    /// Reconcile one address report from the cluster.
    ///
    /// An address is explained when the address registry has it assigned to
    /// the same instance the cluster reports, or when the cluster reports it
    /// without an instance. Explained addresses are cleared, everything else
    /// is observed as an orphan.
    pub async fn reconcile_addresses(&self, reports: &[ClusterAddress]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for report in reports {
            let explained = match report.instance_ip {
                None => true,
                Some(instance) => match self
                    .collaborators
                    .addresses
                    .lookup_address(report.address)
                    .await
                {
                    Ok(Some(record)) => record.instance_ip == Some(instance),
                    Ok(None) => false,
                    Err(e) => {
                        warn!(
                            "Skipping address {} from cluster {}: {}",
                            report, self.name, e
                        );
                        summary.failed += 1;
                        continue;
                    }
                },
            };

            if explained {
                self.orphans.clear(report);
                summary.cleared += 1;
                continue;
            }
            match self.orphans.observe(*report).await {
                OrphanObservation::Observed { .. } => summary.observed += 1,
                OrphanObservation::Remediated { .. } => summary.remediated += 1,
            }
        }
        summary
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn has_public_addressing(&self) -> bool {
        self.settings.read().public_addressing
    }

    pub fn set_public_addressing(&self, enabled: bool) {
        self.settings.write().public_addressing = enabled;
    }

    pub fn is_addressing_initialized(&self) -> bool {
        self.settings.read().addressing_initialized
    }

    pub fn set_addressing_initialized(&self, initialized: bool) {
        self.settings.write().addressing_initialized = initialized;
    }

    pub fn mode(&self) -> u32 {
        self.settings.read().mode
    }

    pub fn set_mode(&self, mode: u32) {
        self.settings.write().mode = mode;
    }

    pub fn address_capacity(&self) -> Option<u32> {
        self.settings.read().address_capacity
    }

    pub fn set_address_capacity(&self, capacity: Option<u32>) {
        self.settings.write().address_capacity = capacity;
    }

    pub fn settings(&self) -> ClusterSettings {
        self.settings.read().clone()
    }

    pub fn apply_settings(&self, settings: ClusterSettings) {
        *self.settings.write() = settings;
    }

    pub fn summary(&self) -> ClusterSummary {
        let snapshot = self.pool.snapshot();
        ClusterSummary {
            name: self.name.clone(),
            settings: self.settings(),
            vlan_range: snapshot.range,
            vlans_available: snapshot.available.len(),
            vlans_assigned: snapshot.assigned.len(),
            orphans: self.orphans.len(),
        }
    }
}

impl PartialEq for ClusterState {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ClusterState {}

impl Hash for ClusterState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.settings.read();
        write!(
            f,
            "ClusterState [addressCapacity={}, clusterName={}, mode={}]",
            settings
                .address_capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unset".to_string()),
            self.name,
            settings.mode
        )
    }
}

impl fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterState")
            .field("name", &self.name)
            .field("settings", &*self.settings.read())
            .field("vlan_range", &self.pool.range())
            .finish()
    }
}
