//! Network token reservation and release on top of the VLAN pool
//!
//! A reservation makes sure the named network carries a VLAN (drawing one from
//! the pool when it has none), mints a token for it and records the token in
//! the network registry. Releasing the last token of a network removes the
//! network from the registry and hands its VLAN back to the pool.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::token::NetworkToken;
use super::vlan::{derive_range, VlanPool, VlanRange, VlanTag};
use crate::backend::{
    Account, AuditEvent, Collaborators, EventKind, EventLevel, LogicalNetwork, RegistryError,
    TokenDetach, VlanInit,
};

/// Errors returned to the operation that asked for a network allocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("Not enough resources available: {0}")]
    NotEnoughResources(String),

    #[error("Network already exists: vlan {0} is not available")]
    NetworkAlreadyExists(VlanTag),

    #[error("Lookup failed: {0} not found")]
    LookupMiss(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// What a release did to the network behind the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ReleaseOutcome {
    /// The network or the token was already gone
    NotTracked,
    /// Other tokens still reference the network
    Retained { remaining: usize },
    /// The network was removed; `vlan` is the tag handed back to the pool
    Freed { vlan: Option<VlanTag> },
}

/// A network together with the VLAN a reservation will use
struct AssignedVlan {
    network: LogicalNetwork,
    vlan: VlanTag,
    /// The tag was drawn from the pool by this reservation
    drawn: bool,
}

pub struct NetworkTokenAllocator {
    cluster: String,
    pool: Arc<VlanPool>,
    collaborators: Collaborators,
}

impl NetworkTokenAllocator {
    pub fn new(cluster: impl Into<String>, pool: Arc<VlanPool>, collaborators: Collaborators) -> Self {
        Self {
            cluster: cluster.into(),
            pool,
            collaborators,
        }
    }

    /// Re-derive the pool's bounds from the live configuration records.
    ///
    /// A failing configuration source leaves the previous bounds in place.
    pub async fn rederive(&self) -> VlanRange {
        let configs = match self.collaborators.configurations.cluster_configurations().await {
            Ok(configs) => configs,
            Err(e) => {
                let range = self.pool.range();
                warn!(
                    cluster = %self.cluster,
                    "Failed to read cluster configurations, keeping vlan range {}: {}", range, e
                );
                return range;
            }
        };

        let range = derive_range(configs.iter().map(|c| &c.vlans));
        let outcome = self.pool.rederive(range);
        self.emit(
            EventKind::ConfigVlans,
            EventLevel::Debug,
            format!(
                "{} {} available={} added={} purged={}",
                range.min, range.max, outcome.available, outcome.added, outcome.purged
            ),
        );
        range
    }

    /// Re-establish a known allocation that pins `vlan` for `network_name`.
    ///
    /// Fails with [`AllocationError::NetworkAlreadyExists`] when the tag is
    /// not currently free; the pool is left untouched in that case.
    pub async fn reserve_existing(
        &self,
        account_id: &str,
        network_name: &str,
        network_uuid: &str,
        vlan: VlanTag,
    ) -> Result<NetworkToken, AllocationError> {
        let account = self
            .collaborators
            .accounts
            .lookup_account(account_id)
            .await?
            .ok_or_else(|| AllocationError::LookupMiss(format!("account {}", account_id)))?;

        if !self.pool.take_specific(vlan) {
            return Err(AllocationError::NetworkAlreadyExists(vlan));
        }

        let token = NetworkToken::new(&self.cluster, account, network_name, network_uuid, vlan);
        self.adopt(&token).await;
        self.emit(EventKind::TokenReserved, EventLevel::Info, token.to_string());
        Ok(token)
    }

    /// Reserve a token on `network_name`, assigning the network a VLAN first
    /// if it has none.
    pub async fn reserve(
        &self,
        owner: &Account,
        network_name: &str,
    ) -> Result<NetworkToken, AllocationError> {
        self.rederive().await;

        let assigned = self.vlan_assigned_network(network_name).await?;
        let token = NetworkToken::new(
            &self.cluster,
            owner.clone(),
            &assigned.network.name,
            &assigned.network.uuid,
            assigned.vlan,
        );

        let attached = match self
            .collaborators
            .networks
            .attach_token(&self.cluster, network_name, token.id)
            .await
        {
            Ok(attached) => attached,
            Err(e) => {
                warn!("Failed to attach token {} to {}: {}", token.id, network_name, e);
                false
            }
        };
        if !attached {
            if assigned.drawn {
                self.undo_assignment(network_name, assigned.vlan).await;
            }
            return Err(AllocationError::NotEnoughResources(format!(
                "failed to record a token on network {}",
                network_name
            )));
        }

        self.emit(EventKind::TokenReserved, EventLevel::Info, token.to_string());
        Ok(token)
    }

    async fn vlan_assigned_network(
        &self,
        network_name: &str,
    ) -> Result<AssignedVlan, AllocationError> {
        let networks = &self.collaborators.networks;
        let network = networks
            .lookup_network(&self.cluster, network_name)
            .await?
            .ok_or_else(|| {
                AllocationError::NotEnoughResources(format!(
                    "Failed to create registry entry for network named: {}",
                    network_name
                ))
            })?;

        if let Some(vlan) = network.assigned_vlan() {
            return Ok(AssignedVlan {
                network,
                vlan,
                drawn: false,
            });
        }

        let vlan = self
            .pool
            .take()
            .ok_or_else(|| AllocationError::NotEnoughResources("vlan tags".to_string()))?;

        // Every failure below must give the tag back before returning.
        match networks.init_vlan(&self.cluster, network_name, vlan).await {
            Ok(VlanInit::Initialized) => {
                self.emit(
                    EventKind::TokenReserved,
                    EventLevel::Info,
                    format!("network {} assigned vlan {}", network.name, vlan),
                );
                Ok(AssignedVlan {
                    network,
                    vlan,
                    drawn: true,
                })
            }
            Ok(VlanInit::AlreadyAssigned(existing)) => {
                self.pool.give_back(vlan);
                debug!(
                    "Network {} was assigned vlan {} concurrently, returned {}",
                    network_name, existing, vlan
                );
                Ok(AssignedVlan {
                    network,
                    vlan: existing,
                    drawn: false,
                })
            }
            Ok(VlanInit::Rejected) => {
                self.pool.give_back(vlan);
                Err(AllocationError::NotEnoughResources(
                    "an error occurred obtaining a usable vlan tag".to_string(),
                ))
            }
            Err(e) => {
                self.pool.give_back(vlan);
                warn!("Failed to initialize vlan {} for {}: {}", vlan, network_name, e);
                Err(AllocationError::NotEnoughResources(
                    "an error occurred obtaining a usable vlan tag".to_string(),
                ))
            }
        }
    }

    /// Roll back a VLAN this reservation assigned when no token could be
    /// recorded. The tag only goes back to the pool if the registry entry that
    /// carried it is the one removed here.
    async fn undo_assignment(&self, network_name: &str, vlan: VlanTag) {
        match self
            .collaborators
            .networks
            .remove_if_unused(&self.cluster, network_name)
            .await
        {
            Ok(Some(removed)) if removed.assigned_vlan() == Some(vlan) => {
                self.pool.give_back(vlan);
                debug!("Returned vlan {} after failed reservation on {}", vlan, network_name);
            }
            Ok(_) => {
                debug!("Network {} changed hands, vlan {} left to its owner", network_name, vlan);
            }
            Err(e) => {
                warn!("Failed to roll back vlan {} for {}: {}", vlan, network_name, e);
            }
        }
    }

    /// Record a pinned token against its network when the registry knows it,
    /// so that a later release can hand the tag back.
    async fn adopt(&self, token: &NetworkToken) {
        let networks = &self.collaborators.networks;
        let adopted = match networks
            .init_vlan(&self.cluster, &token.network_name, token.vlan)
            .await
        {
            Ok(VlanInit::Initialized) => true,
            Ok(VlanInit::AlreadyAssigned(existing)) => existing == token.vlan,
            Ok(VlanInit::Rejected) => false,
            Err(e) => {
                warn!("Failed to record vlan {} for {}: {}", token.vlan, token.network_name, e);
                false
            }
        };
        if !adopted {
            // Release cannot find this token, so the tag stays pinned.
            warn!(
                "Network {} not tracked with vlan {}, token held outside the registry",
                token.network_name, token.vlan
            );
            return;
        }
        if let Err(e) = networks
            .attach_token(&self.cluster, &token.network_name, token.id)
            .await
        {
            warn!("Failed to attach token {} to {}: {}", token.id, token.network_name, e);
        }
    }

    /// Release a token.
    ///
    /// Releasing an unknown or already released token is a no-op.
    pub async fn release(&self, token: &NetworkToken) -> Result<ReleaseOutcome, AllocationError> {
        self.emit(EventKind::TokenReturned, EventLevel::Info, token.to_string());

        let networks = &self.collaborators.networks;
        match networks
            .detach_token(&self.cluster, &token.network_name, token.id)
            .await?
        {
            TokenDetach::NetworkMissing | TokenDetach::NotMember => {
                debug!("Token {} no longer tracked, nothing to release", token.id);
                Ok(ReleaseOutcome::NotTracked)
            }
            TokenDetach::Detached { remaining } if remaining > 0 => {
                Ok(ReleaseOutcome::Retained { remaining })
            }
            TokenDetach::Detached { .. } => {
                match networks
                    .remove_if_unused(&self.cluster, &token.network_name)
                    .await?
                {
                    Some(removed) => {
                        let vlan = removed.assigned_vlan();
                        if let Some(tag) = vlan {
                            self.pool.give_back(tag);
                        }
                        Ok(ReleaseOutcome::Freed { vlan })
                    }
                    None => {
                        // A reservation attached a new token in the meantime.
                        let remaining = networks
                            .lookup_network(&self.cluster, &token.network_name)
                            .await?
                            .map(|n| n.tokens.len())
                            .unwrap_or(0);
                        Ok(ReleaseOutcome::Retained { remaining })
                    }
                }
            }
        }
    }

    fn emit(&self, kind: EventKind, level: EventLevel, message: String) {
        self.collaborators
            .events
            .record(AuditEvent::new(kind, level, message).for_cluster(&self.cluster));
    }
}


#[cfg(test)]
mod tests {
    use super::mock::FlakyNetworkRegistry;
    use super::*;
    use crate::backend::{
        ChannelDispatcher, ClusterConfiguration, InMemoryAccounts, InMemoryAddressRegistry,
        RecordingEventSink, StaticConfigurationSource,
    };
    use crate::cluster::vlan::VlanBounds;
    use std::sync::atomic::Ordering;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        allocator: NetworkTokenAllocator,
        pool: Arc<VlanPool>,
        networks: Arc<FlakyNetworkRegistry>,
        configs: Arc<StaticConfigurationSource>,
        events: Arc<RecordingEventSink>,
        alice: Account,
    }

    fn fixture(min: u16, max: u16) -> Fixture {
        let configs = Arc::new(StaticConfigurationSource::new([ClusterConfiguration::new(
            "cluster-a",
            VlanBounds::new(Some(min), Some(max)),
        )]));
        let accounts = Arc::new(InMemoryAccounts::new());
        let alice = Account::new("acct-1", "alice");
        accounts.insert(alice.clone());
        let networks = Arc::new(FlakyNetworkRegistry::default());
        let events = Arc::new(RecordingEventSink::new());
        let (dispatcher, _rx) = ChannelDispatcher::channel();

        let collaborators = Collaborators {
            configurations: configs.clone(),
            accounts,
            networks: networks.clone(),
            addresses: Arc::new(InMemoryAddressRegistry::new()),
            dispatcher: Arc::new(dispatcher),
            events: events.clone(),
        };
        let pool = Arc::new(VlanPool::default());
        Fixture {
            allocator: NetworkTokenAllocator::new("cluster-a", pool.clone(), collaborators),
            pool,
            networks,
            configs,
            events,
            alice,
        }
    }

    #[tokio::test]
    async fn test_reserve_assigns_lowest_vlan() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");

        let token = f.allocator.reserve(&f.alice, "web").await.unwrap();

        assert_eq!(token.vlan, VlanTag::new(10));
        assert_eq!(token.cluster, "cluster-a");
        assert_eq!(f.pool.range(), VlanRange::new(10, 20));
        let net = f.networks.inner.get("cluster-a", "web").unwrap();
        assert_eq!(net.assigned_vlan(), Some(VlanTag::new(10)));
        assert!(net.tokens.contains(&token.id));
        assert!(!f.events.of_kind(EventKind::TokenReserved).is_empty());
    }

    #[tokio::test]
    async fn test_reserve_reuses_network_vlan() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");

        let first = f.allocator.reserve(&f.alice, "web").await.unwrap();
        let second = f.allocator.reserve(&f.alice, "web").await.unwrap();

        assert_eq!(first.vlan, second.vlan);
        assert_eq!(f.networks.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.pool.available_len(), 9);
    }

    #[tokio::test]
    async fn test_reserve_unknown_network() {
        let f = fixture(10, 20);
        let err = assert_err!(f.allocator.reserve(&f.alice, "missing").await);
        assert!(matches!(err, AllocationError::NotEnoughResources(_)));
        assert_eq!(f.pool.available_len(), 10);
    }

    #[tokio::test]
    async fn test_rejected_init_restores_tag() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");
        f.networks.reject_init.store(true, Ordering::SeqCst);

        let result = f.allocator.reserve(&f.alice, "web").await;

        assert!(matches!(result, Err(AllocationError::NotEnoughResources(_))));
        assert!(f.pool.is_available(VlanTag::new(10)));
        assert_eq!(f.pool.available_len(), 10);
        assert_eq!(f.pool.assigned_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_init_restores_tag() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");
        f.networks.fail_init.store(true, Ordering::SeqCst);

        let result = f.allocator.reserve(&f.alice, "web").await;

        assert!(matches!(result, Err(AllocationError::NotEnoughResources(_))));
        assert_eq!(f.pool.available_len(), 10);
    }

    #[tokio::test]
    async fn test_failed_attach_returns_drawn_tag() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");
        f.networks.fail_attach.store(true, Ordering::SeqCst);

        let result = f.allocator.reserve(&f.alice, "web").await;

        assert!(matches!(result, Err(AllocationError::NotEnoughResources(_))));
        assert_eq!(f.pool.available_len(), 10);
        assert_eq!(f.pool.assigned_len(), 0);
        assert!(f.networks.inner.get("cluster-a", "web").is_none());
    }

    #[tokio::test]
    async fn test_failed_attach_keeps_vlan_of_busy_network() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");
        let held = f.allocator.reserve(&f.alice, "web").await.unwrap();
        f.networks.fail_attach.store(true, Ordering::SeqCst);

        assert_err!(f.allocator.reserve(&f.alice, "web").await);

        assert!(!f.pool.is_available(held.vlan));
        assert_eq!(f.pool.assigned_len(), 1);
        let net = f.networks.inner.get("cluster-a", "web").unwrap();
        assert_eq!(net.assigned_vlan(), Some(held.vlan));
        assert!(net.tokens.contains(&held.id));
    }

    #[tokio::test]
    async fn test_exhausted_pool_does_not_touch_registry() {
        let f = fixture(10, 11);
        f.networks.inner.define("cluster-a", f.alice.clone(), "a");
        f.networks.inner.define("cluster-a", f.alice.clone(), "b");

        assert_ok!(f.allocator.reserve(&f.alice, "a").await);
        let calls = f.networks.init_calls.load(Ordering::SeqCst);
        let result = f.allocator.reserve(&f.alice, "b").await;

        assert_eq!(
            result,
            Err(AllocationError::NotEnoughResources("vlan tags".to_string()))
        );
        assert_eq!(f.networks.init_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_release_last_token_frees_vlan() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");
        let token = f.allocator.reserve(&f.alice, "web").await.unwrap();

        let outcome = f.allocator.release(&token).await.unwrap();

        assert_eq!(outcome, ReleaseOutcome::Freed { vlan: Some(token.vlan) });
        assert!(f.pool.is_available(token.vlan));
        assert!(f.networks.inner.get("cluster-a", "web").is_none());
        assert_eq!(f.events.of_kind(EventKind::TokenReturned).len(), 1);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "web");
        let token = f.allocator.reserve(&f.alice, "web").await.unwrap();

        assert_ok!(f.allocator.release(&token).await);
        let available = f.pool.available_len();
        let again = f.allocator.release(&token).await.unwrap();

        assert_eq!(again, ReleaseOutcome::NotTracked);
        assert_eq!(f.pool.available_len(), available);
    }

    #[tokio::test]
    async fn test_reserve_existing_pins_tag() {
        let f = fixture(10, 20);
        f.networks.inner.define("cluster-a", f.alice.clone(), "restored");

        let token = f
            .allocator
            .reserve_existing("acct-1", "restored", "net-7", VlanTag::new(15))
            .await
            .unwrap();

        assert_eq!(token.vlan, VlanTag::new(15));
        assert_eq!(token.network_uuid, "net-7");
        assert!(!f.pool.is_available(VlanTag::new(15)));

        let outcome = f.allocator.release(&token).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Freed { vlan: Some(VlanTag::new(15)) });
        assert!(f.pool.is_available(VlanTag::new(15)));
    }

    #[tokio::test]
    async fn test_reserve_existing_unknown_network_stays_pinned() {
        let f = fixture(10, 20);

        let token = f
            .allocator
            .reserve_existing("acct-1", "unregistered", "net-9", VlanTag::new(14))
            .await
            .unwrap();

        assert_eq!(
            f.allocator.release(&token).await.unwrap(),
            ReleaseOutcome::NotTracked
        );
        assert!(!f.pool.is_available(VlanTag::new(14)));
        assert!(f.networks.inner.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_existing_held_tag_fails() {
        let f = fixture(10, 20);
        f.pool.take_specific(VlanTag::new(12));
        let before = f.pool.snapshot();

        let result = f
            .allocator
            .reserve_existing("acct-1", "other", "net-8", VlanTag::new(12))
            .await;

        assert_eq!(result, Err(AllocationError::NetworkAlreadyExists(VlanTag::new(12))));
        assert_eq!(f.pool.snapshot(), before);
    }

    #[tokio::test]
    async fn test_reserve_existing_unknown_account() {
        let f = fixture(10, 20);
        let result = f
            .allocator
            .reserve_existing("nobody", "web", "net-1", VlanTag::new(12))
            .await;

        assert!(matches!(result, Err(AllocationError::LookupMiss(_))));
        assert!(f.pool.is_available(VlanTag::new(12)));
    }

    #[tokio::test]
    async fn test_rederive_tracks_config_changes() {
        let f = fixture(10, 20);
        assert_eq!(f.allocator.rederive().await, VlanRange::new(10, 20));

        f.configs.set_bounds("cluster-b", VlanBounds::new(Some(12), Some(30)));
        assert_eq!(f.allocator.rederive().await, VlanRange::new(12, 20));
        assert_eq!(f.pool.available_len(), 8);

        assert!(!f.events.of_kind(EventKind::ConfigVlans).is_empty());
    }
}
