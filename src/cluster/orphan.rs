//! Orphaned public address tracking
//!
//! A cluster periodically reports the public addresses it has in use. An
//! address the controller cannot account for is "orphaned". One sighting is
//! treated as reporting lag; repeated sightings escalate until the tracker
//! remediates the address and forgets it.
//!
//! ```text
//!   unseen ──observe──▶ observed(1) ──observe──▶ observed(n) ──observe──▶ remediated
//!      ▲                     │                        │                       │
//!      └──────clear──────────┴─────────clear──────────┘                       │
//!      └──────────────────────────(record removed)────────────────────────────┘
//! ```

use std::fmt;
use std::net::IpAddr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{AuditEvent, ClusterCommand, Collaborators, EventKind, EventLevel};

/// Count recorded on the first sighting of an address
pub const FIRST_SIGHTING: u32 = 1;

/// Clearing a record seen more often than this logs it as stale
pub const STALE_AFTER: u32 = 2;

/// An address seen more often than this is remediated
pub const REMEDIATE_AFTER: u32 = 3;

/// An address as reported by a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAddress {
    pub address: IpAddr,
    #[serde(default)]
    pub instance_ip: Option<IpAddr>,
}

impl ClusterAddress {
    pub fn new(address: IpAddr, instance_ip: Option<IpAddr>) -> Self {
        Self {
            address,
            instance_ip,
        }
    }
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance_ip {
            Some(instance) => write!(f, "{} -> {}", self.address, instance),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Escalation thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanPolicy {
    pub stale_after: u32,
    pub remediate_after: u32,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self {
            stale_after: STALE_AFTER,
            remediate_after: REMEDIATE_AFTER,
        }
    }
}

/// Per-address state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "count", rename_all = "camelCase")]
pub enum OrphanState {
    Unseen,
    Observed(u32),
    /// Threshold crossed after `n` sightings; never stored
    Remediated(u32),
}

impl OrphanState {
    /// Transition for one more sighting
    pub fn observe(self, policy: &OrphanPolicy) -> OrphanState {
        match self {
            OrphanState::Unseen | OrphanState::Remediated(_) => OrphanState::Observed(FIRST_SIGHTING),
            OrphanState::Observed(n) => {
                let count = n.saturating_add(1);
                if count > policy.remediate_after {
                    OrphanState::Remediated(count)
                } else {
                    OrphanState::Observed(count)
                }
            }
        }
    }

    pub fn count(self) -> u32 {
        match self {
            OrphanState::Unseen => 0,
            OrphanState::Observed(n) | OrphanState::Remediated(n) => n,
        }
    }

    pub fn is_stale(self, policy: &OrphanPolicy) -> bool {
        self.count() > policy.stale_after
    }
}

/// The corrective action taken for a confirmed orphan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "detail", rename_all = "camelCase")]
pub enum Remediation {
    /// An unassign command was handed to the dispatch subsystem
    UnassignDispatched,
    /// A system-owned address was released directly
    Released,
    /// The address registry has no record of the address
    SkippedMissing,
    /// Known, but neither assigned nor system-owned; left alone
    SkippedUnowned,
    Failed(String),
}

/// Result of one `observe` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OrphanObservation {
    Observed { count: u32 },
    Remediated { count: u32, action: Remediation },
}

pub struct OrphanAddressTracker {
    cluster: String,
    policy: OrphanPolicy,
    records: DashMap<ClusterAddress, OrphanState>,
    collaborators: Collaborators,
}

impl OrphanAddressTracker {
    pub fn new(cluster: impl Into<String>, policy: OrphanPolicy, collaborators: Collaborators) -> Self {
        Self {
            cluster: cluster.into(),
            policy,
            records: DashMap::new(),
            collaborators,
        }
    }

    pub fn policy(&self) -> OrphanPolicy {
        self.policy
    }

    /// Forget an address; returns the state it had, if any
    pub fn clear(&self, address: &ClusterAddress) -> Option<OrphanState> {
        let (_, state) = self.records.remove(address)?;
        if state.is_stale(&self.policy) {
            info!(
                "Forgetting stale orphan address mapping from cluster {} for {}",
                self.cluster, address
            );
        }
        Some(state)
    }

    /// Record one more sighting of an unexplained address
    pub async fn observe(&self, address: ClusterAddress) -> OrphanObservation {
        // The entry guard is dropped before any await below.
        let state = match self.records.entry(address) {
            Entry::Vacant(entry) => {
                let state = OrphanState::Unseen.observe(&self.policy);
                entry.insert(state);
                state
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get().observe(&self.policy);
                if let OrphanState::Remediated(_) = state {
                    entry.remove();
                } else {
                    entry.insert(state);
                }
                state
            }
        };

        match state {
            OrphanState::Remediated(count) => {
                self.emit(
                    EventLevel::Debug,
                    format!("Updated orphaned public ip address: {} count={}", address, count),
                );
                self.emit(
                    EventLevel::Warn,
                    format!(
                        "Unassigning orphaned public ip address: {} count={}",
                        address, count
                    ),
                );
                let action = self.remediate(&address).await;
                OrphanObservation::Remediated { count, action }
            }
            OrphanState::Observed(FIRST_SIGHTING) => {
                self.emit(
                    EventLevel::Debug,
                    format!("Found orphaned public ip address: {} count={}", address, FIRST_SIGHTING),
                );
                OrphanObservation::Observed {
                    count: FIRST_SIGHTING,
                }
            }
            other => {
                let count = other.count();
                self.emit(
                    EventLevel::Debug,
                    format!("Updated orphaned public ip address: {} count={}", address, count),
                );
                OrphanObservation::Observed { count }
            }
        }
    }

    async fn remediate(&self, address: &ClusterAddress) -> Remediation {
        let addresses = &self.collaborators.addresses;
        let record = match addresses.lookup_address(address.address).await {
            Ok(Some(record)) => record,
            Ok(None) => return Remediation::SkippedMissing,
            Err(e) => {
                warn!("Failed to look up orphaned address {}: {}", address, e);
                return Remediation::Failed(e.to_string());
            }
        };

        if record.is_assigned() {
            let command = ClusterCommand::UnassignAddress {
                public_ip: address.address,
                instance_ip: address.instance_ip,
            };
            match self.collaborators.dispatcher.dispatch(&self.cluster, command) {
                Ok(()) => Remediation::UnassignDispatched,
                Err(e) => {
                    warn!("{}", e);
                    Remediation::Failed(e.to_string())
                }
            }
        } else if record.system_owned {
            match addresses.release_address(address.address).await {
                Ok(()) => Remediation::Released,
                Err(e) => {
                    warn!("Failed to release orphaned address {}: {}", address, e);
                    Remediation::Failed(e.to_string())
                }
            }
        } else {
            debug!(
                "Orphaned address {} is neither assigned nor system-owned, leaving it in place",
                address
            );
            Remediation::SkippedUnowned
        }
    }

    /// Current sighting count for an address
    pub fn count(&self, address: &ClusterAddress) -> Option<u32> {
        self.records.get(address).map(|r| r.count())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All tracked addresses with their counts, ordered by address
    pub fn snapshot(&self) -> Vec<(ClusterAddress, u32)> {
        let mut records: Vec<(ClusterAddress, u32)> = self
            .records
            .iter()
            .map(|r| (*r.key(), r.value().count()))
            .collect();
        records.sort();
        records
    }

    fn emit(&self, level: EventLevel, message: String) {
        self.collaborators.events.record(
            AuditEvent::new(EventKind::AddressState, level, message).for_cluster(&self.cluster),
        );
    }
}
