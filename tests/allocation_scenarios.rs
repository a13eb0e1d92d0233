//! End-to-end allocation scenarios against the in-memory collaborators

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use clustercoord::backend::{
    Account, ChannelDispatcher, ClusterConfiguration, Collaborators, EventKind, InMemoryAccounts,
    InMemoryAddressRegistry, InMemoryNetworkRegistry, LogicalNetwork, NetworkRegistry,
    RecordingEventSink, RegistryError, StaticConfigurationSource, TokenDetach, VlanInit,
};
use clustercoord::cluster::{
    AllocationError, ClusterRegistry, ClusterState, ReleaseOutcome, VlanBounds, VlanRange,
    VlanTag,
};

/// Network registry whose vlan initialization can be switched off
#[derive(Default)]
struct RefusingRegistry {
    inner: InMemoryNetworkRegistry,
    refuse: AtomicBool,
}

#[async_trait]
impl NetworkRegistry for RefusingRegistry {
    async fn lookup_network(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<LogicalNetwork>, RegistryError> {
        self.inner.lookup_network(cluster, name).await
    }

    async fn init_vlan(
        &self,
        cluster: &str,
        name: &str,
        vlan: VlanTag,
    ) -> Result<VlanInit, RegistryError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("network service down".to_string()));
        }
        self.inner.init_vlan(cluster, name, vlan).await
    }

    async fn attach_token(
        &self,
        cluster: &str,
        name: &str,
        token: Uuid,
    ) -> Result<bool, RegistryError> {
        self.inner.attach_token(cluster, name, token).await
    }

    async fn detach_token(
        &self,
        cluster: &str,
        name: &str,
        token: Uuid,
    ) -> Result<TokenDetach, RegistryError> {
        self.inner.detach_token(cluster, name, token).await
    }

    async fn remove_if_unused(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<LogicalNetwork>, RegistryError> {
        self.inner.remove_if_unused(cluster, name).await
    }
}

struct Harness {
    registry: ClusterRegistry,
    networks: Arc<RefusingRegistry>,
    configurations: Arc<StaticConfigurationSource>,
    events: Arc<RecordingEventSink>,
    owner: Account,
}

impl Harness {
    fn new(min: u16, max: u16) -> Self {
        let configurations = Arc::new(StaticConfigurationSource::new([
            ClusterConfiguration::new("east", VlanBounds::new(Some(min), Some(max))),
        ]));
        let owner = Account::new("acct-1", "alice");
        let accounts = Arc::new(InMemoryAccounts::new());
        accounts.insert(owner.clone());
        let networks = Arc::new(RefusingRegistry::default());
        let events = Arc::new(RecordingEventSink::new());
        let (dispatcher, _rx) = ChannelDispatcher::channel();

        let registry = ClusterRegistry::new(Collaborators {
            configurations: configurations.clone(),
            accounts,
            networks: networks.clone(),
            addresses: Arc::new(InMemoryAddressRegistry::new()),
            dispatcher: Arc::new(dispatcher),
            events: events.clone(),
        });

        Self {
            registry,
            networks,
            configurations,
            events,
            owner,
        }
    }

    fn cluster(&self) -> Arc<ClusterState> {
        self.registry.get_or_create("east")
    }

    fn define(&self, name: &str) -> LogicalNetwork {
        self.define_in("east", name)
    }

    fn define_in(&self, cluster: &str, name: &str) -> LogicalNetwork {
        self.networks.inner.define(cluster, self.owner.clone(), name)
    }
}

#[tokio::test]
async fn test_range_fills_then_exhausts() {
    let harness = Harness::new(10, 20);
    let cluster = harness.cluster();

    let mut vlans = HashSet::new();
    for i in 0..10 {
        let name = format!("net-{}", i);
        harness.define(&name);
        let token = assert_ok!(cluster.reserve(&harness.owner, &name).await);
        assert!((10..20).contains(&token.vlan.value()));
        vlans.insert(token.vlan);
    }
    assert_eq!(vlans.len(), 10);

    harness.define("net-10");
    let err = assert_err!(cluster.reserve(&harness.owner, "net-10").await);
    assert!(matches!(err, AllocationError::NotEnoughResources(_)));
    let minted = harness
        .events
        .of_kind(EventKind::TokenReserved)
        .into_iter()
        .filter(|e| e.message.starts_with("NetworkToken"))
        .count();
    assert_eq!(minted, 10);
}

#[tokio::test]
async fn test_last_release_returns_vlan() {
    let harness = Harness::new(10, 20);
    let cluster = harness.cluster();
    harness.define("shared");

    let first = cluster.reserve(&harness.owner, "shared").await.unwrap();
    let second = cluster.reserve(&harness.owner, "shared").await.unwrap();
    assert_eq!(first.vlan, second.vlan);
    assert_ne!(first.id, second.id);

    let outcome = cluster.release(&first).await.unwrap();
    assert_eq!(outcome, ReleaseOutcome::Retained { remaining: 1 });
    assert!(!cluster.vlan_pool().is_available(first.vlan));

    let outcome = cluster.release(&second).await.unwrap();
    assert_eq!(
        outcome,
        ReleaseOutcome::Freed {
            vlan: Some(second.vlan)
        }
    );
    assert!(harness.networks.inner.get("east", "shared").is_none());
    assert_eq!(cluster.take_vlan(), Some(second.vlan));
}

#[tokio::test]
async fn test_reserve_existing_held_tag_conflicts() {
    let harness = Harness::new(10, 20);
    let cluster = harness.cluster();
    harness.define("web");

    let held = cluster.reserve(&harness.owner, "web").await.unwrap();
    let before = cluster.pool_snapshot();

    let err = assert_err!(
        cluster
            .reserve_existing("acct-1", "legacy", "u-legacy", held.vlan)
            .await
    );
    assert_eq!(err, AllocationError::NetworkAlreadyExists(held.vlan));
    assert_eq!(cluster.pool_snapshot(), before);
}

#[tokio::test]
async fn test_pinned_vlan_is_freed_on_release() {
    let harness = Harness::new(10, 20);
    let cluster = harness.cluster();
    cluster.rederive().await;
    harness.networks.inner.insert(
        "east",
        LogicalNetwork::new(harness.owner.clone(), "legacy", "u-legacy"),
    );

    let token = cluster
        .reserve_existing("acct-1", "legacy", "u-legacy", VlanTag::new(15))
        .await
        .unwrap();
    assert!(!cluster.vlan_pool().is_available(VlanTag::new(15)));

    assert_eq!(
        cluster.release(&token).await.unwrap(),
        ReleaseOutcome::Freed {
            vlan: Some(VlanTag::new(15))
        }
    );
    assert!(cluster.vlan_pool().is_available(VlanTag::new(15)));
}

#[tokio::test]
async fn test_failed_init_does_not_leak() {
    let harness = Harness::new(10, 12);
    let cluster = harness.cluster();
    harness.define("web");
    harness.networks.refuse.store(true, Ordering::SeqCst);

    for _ in 0..5 {
        let err = assert_err!(cluster.reserve(&harness.owner, "web").await);
        assert!(matches!(err, AllocationError::NotEnoughResources(_)));
        assert_eq!(cluster.vlan_pool().available_len(), 2);
        assert_eq!(cluster.vlan_pool().assigned_len(), 0);
    }

    harness.networks.refuse.store(false, Ordering::SeqCst);
    let token = assert_ok!(cluster.reserve(&harness.owner, "web").await);
    assert_eq!(token.vlan, VlanTag::new(10));
}

#[tokio::test]
async fn test_clusters_do_not_share_network_vlans() {
    let harness = Harness::new(10, 20);
    harness
        .configurations
        .set_bounds("west", VlanBounds::new(Some(10), Some(20)));
    let east = harness.cluster();
    let west = harness.registry.get_or_create("west");
    harness.define_in("east", "web");
    harness.define_in("west", "web");
    harness.define_in("west", "db");

    let web_east = east.reserve(&harness.owner, "web").await.unwrap();
    let web_west = west.reserve(&harness.owner, "web").await.unwrap();
    let db_west = west.reserve(&harness.owner, "db").await.unwrap();

    assert_ne!(web_west.vlan, db_west.vlan);
    assert!(!west.vlan_pool().is_available(web_west.vlan));
    assert!(!west.vlan_pool().is_available(db_west.vlan));
    assert_eq!(west.vlan_pool().assigned_len(), 2);
    assert_eq!(east.vlan_pool().assigned_len(), 1);

    // Releasing west's web frees west's tag only.
    assert_eq!(
        west.release(&web_west).await.unwrap(),
        ReleaseOutcome::Freed {
            vlan: Some(web_west.vlan)
        }
    );
    assert!(!east.vlan_pool().is_available(web_east.vlan));
    assert!(!west.vlan_pool().is_available(db_west.vlan));
    assert_eq!(east.vlan_pool().assigned_len(), 1);
    let still_east = harness.networks.inner.get("east", "web").unwrap();
    assert!(still_east.tokens.contains(&web_east.id));
}

#[tokio::test]
async fn test_double_release_is_noop() {
    let harness = Harness::new(10, 20);
    let cluster = harness.cluster();
    harness.define("web");

    let token = cluster.reserve(&harness.owner, "web").await.unwrap();
    assert!(matches!(
        cluster.release(&token).await.unwrap(),
        ReleaseOutcome::Freed { .. }
    ));
    assert_eq!(
        cluster.release(&token).await.unwrap(),
        ReleaseOutcome::NotTracked
    );

    assert_eq!(cluster.vlan_pool().available_len(), 10);
    assert_eq!(cluster.vlan_pool().assigned_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_get_distinct_vlans() {
    let harness = Arc::new(Harness::new(100, 164));
    for i in 0..64 {
        harness.define(&format!("net-{}", i));
    }

    let mut handles = Vec::new();
    for i in 0..64 {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            let cluster = harness.cluster();
            cluster
                .reserve(&harness.owner, &format!("net-{}", i))
                .await
        }));
    }

    let mut vlans = HashSet::new();
    for handle in handles {
        let token = handle.await.unwrap().unwrap();
        assert!(vlans.insert(token.vlan), "vlan {} handed out twice", token.vlan);
    }
    assert_eq!(vlans.len(), 64);
    assert_eq!(harness.cluster().vlan_pool().available_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rederive_under_churn_keeps_pool_consistent() {
    let harness = Arc::new(Harness::new(10, 60));
    let cluster = harness.cluster();
    cluster.rederive().await;

    let mut handles = Vec::new();
    for worker in 0..4 {
        let cluster = cluster.clone();
        handles.push(tokio::spawn(async move {
            let mut held = Vec::new();
            for round in 0..200 {
                if let Some(tag) = cluster.take_vlan() {
                    held.push(tag);
                }
                if (round + worker) % 3 == 0 {
                    if let Some(tag) = held.pop() {
                        cluster.return_vlan(tag);
                    }
                }
                tokio::task::yield_now().await;
            }
            held
        }));
    }

    let bounds = [(20, 40), (10, 60), (30, 50), (10, 60)];
    for (min, max) in bounds {
        harness
            .configurations
            .set_bounds("east", VlanBounds::new(Some(min), Some(max)));
        cluster.rederive().await;
        tokio::task::yield_now().await;
    }

    let mut held = HashSet::new();
    for handle in handles {
        for tag in handle.await.unwrap() {
            assert!(held.insert(tag), "vlan {} held twice", tag);
        }
    }

    let snapshot = cluster.pool_snapshot();
    assert_eq!(snapshot.range, VlanRange::new(10, 60));
    assert!(snapshot.available.len() <= snapshot.range.len());
    for tag in &held {
        assert!(!snapshot.available.contains(tag), "held vlan {} is available", tag);
    }
}
