//! # Cluster Coordination
//!
//! Per-cluster bookkeeping for a multi-tenant virtual networking controller.
//!
//! ## Core Resources
//!
//! - **VlanPool**: the free and assigned VLAN tags of one cluster
//! - **NetworkToken**: a tenant operation's claim on a network's VLAN
//! - **OrphanAddressTracker**: public addresses the cluster reports but the
//!   controller cannot account for
//! - **ClusterState**: one cluster's pool, tracker and settings
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ClusterRegistry                       │
//! │  ┌────────────────────┐      ┌────────────────────┐      │
//! │  │ ClusterState east  │ ...  │ ClusterState west  │      │
//! │  │  VlanPool          │      │  VlanPool          │      │
//! │  │  TokenAllocator    │      │  TokenAllocator    │      │
//! │  │  OrphanTracker     │      │  OrphanTracker     │      │
//! │  └─────────┬──────────┘      └─────────┬──────────┘      │
//! └────────────┼───────────────────────────┼─────────────────┘
//!              │        Collaborators      │
//!              ▼                           ▼
//!   configurations · accounts · networks · addresses · dispatcher · events
//! ```

pub mod allocator;
pub mod api;
pub mod driver;
pub mod orphan;
pub mod registry;
pub mod state;
pub mod token;
pub mod vlan;

pub use allocator::{AllocationError, NetworkTokenAllocator, ReleaseOutcome};
pub use api::{create_api_router, ApiState};
pub use driver::{spawn_rederive_driver, DEFAULT_REDERIVE_INTERVAL_SECS};
pub use orphan::{
    ClusterAddress, OrphanAddressTracker, OrphanObservation, OrphanPolicy, OrphanState,
    Remediation, FIRST_SIGHTING, REMEDIATE_AFTER, STALE_AFTER,
};
pub use registry::ClusterRegistry;
pub use state::{ClusterSettings, ClusterState, ClusterSummary, ReconcileSummary};
pub use token::NetworkToken;
pub use vlan::{
    derive_range, PoolSnapshot, RederiveOutcome, VlanBounds, VlanPool, VlanRange, VlanTag,
    DEFAULT_MAX_VLAN, DEFAULT_MIN_VLAN,
};
