//! Process-wide registry of cluster states
//!
//! States are created on first use and live for the rest of the process.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::orphan::OrphanPolicy;
use super::state::ClusterState;
use super::vlan::VlanRange;
use crate::backend::Collaborators;

#[derive(Clone)]
pub struct ClusterRegistry {
    clusters: Arc<DashMap<String, Arc<ClusterState>>>,
    collaborators: Collaborators,
    policy: OrphanPolicy,
}

impl ClusterRegistry {
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_policy(collaborators, OrphanPolicy::default())
    }

    pub fn with_policy(collaborators: Collaborators, policy: OrphanPolicy) -> Self {
        Self {
            clusters: Arc::new(DashMap::new()),
            collaborators,
            policy,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Get the state for `name`, creating it on first use
    pub fn get_or_create(&self, name: &str) -> Arc<ClusterState> {
        if let Some(state) = self.clusters.get(name) {
            return state.clone();
        }
        self.clusters
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Creating cluster state for {}", name);
                Arc::new(ClusterState::with_policy(
                    name,
                    self.collaborators.clone(),
                    self.policy,
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterState>> {
        self.clusters.get(name).map(|r| r.clone())
    }

    /// All cluster states, ordered by name
    pub fn list(&self) -> Vec<Arc<ClusterState>> {
        let mut clusters: Vec<Arc<ClusterState>> =
            self.clusters.iter().map(|r| r.value().clone()).collect();
        clusters.sort_by(|a, b| a.name().cmp(b.name()));
        clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Re-derive the VLAN range of every cluster
    pub async fn rederive_all(&self) -> Vec<(String, VlanRange)> {
        // Collect first so no map guard is held across an await.
        let clusters = self.list();
        let ranges = futures::future::join_all(clusters.iter().map(|c| c.rederive())).await;
        clusters
            .iter()
            .map(|c| c.name().to_string())
            .zip(ranges)
            .collect()
    }
}
