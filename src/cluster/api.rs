//! Control API Server
//!
//! Provides REST endpoints over the cluster coordinator:
//! - Clusters: list, get, re-derive VLAN range
//! - Tokens: reserve, reserve existing, release
//! - Addresses: report, list and clear orphans
//! - Configurations: update VLAN bounds

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::{
    allocator::AllocationError,
    orphan::{ClusterAddress, OrphanState},
    registry::ClusterRegistry,
    state::ClusterState,
    token::NetworkToken,
    vlan::{VlanBounds, VlanRange, VlanTag, DEFAULT_MAX_VLAN},
};
use crate::backend::{Account, StaticConfigurationSource};

/// Shared state for the control API
#[derive(Clone)]
pub struct ApiState {
    pub registry: ClusterRegistry,
    pub configurations: Arc<StaticConfigurationSource>,
}

impl ApiState {
    pub fn new(registry: ClusterRegistry, configurations: Arc<StaticConfigurationSource>) -> Self {
        Self {
            registry,
            configurations,
        }
    }
}

/// Create the control API router
pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        // Clusters
        .route("/v1/clusters", get(list_clusters))
        .route("/v1/clusters/{name}", get(get_cluster))
        .route("/v1/clusters/{name}/rederive", post(rederive_cluster))
        // Tokens
        .route("/v1/clusters/{name}/tokens", post(reserve_token))
        .route("/v1/clusters/{name}/tokens/existing", post(reserve_existing))
        .route("/v1/clusters/{name}/tokens/release", post(release_token))
        // Addresses
        .route("/v1/clusters/{name}/addresses/report", post(report_addresses))
        .route("/v1/clusters/{name}/orphans", get(list_orphans))
        .route("/v1/clusters/{name}/orphans/{address}", delete(clear_orphan))
        // Configurations
        .route("/v1/configurations/{name}/vlans", put(update_vlans))
        // Health check
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unknown_cluster(name: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("Cluster not found: {}", name))
    }
}

impl From<AllocationError> for ApiError {
    fn from(e: AllocationError) -> Self {
        let status = match &e {
            AllocationError::NotEnoughResources(_) => StatusCode::SERVICE_UNAVAILABLE,
            AllocationError::NetworkAlreadyExists(_) => StatusCode::CONFLICT,
            AllocationError::LookupMiss(_) => StatusCode::NOT_FOUND,
            AllocationError::Registry(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed: {}", self.message);
        }
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

fn cluster(state: &ApiState, name: &str) -> Result<Arc<ClusterState>, ApiError> {
    state
        .registry
        .get(name)
        .ok_or_else(|| ApiError::unknown_cluster(name))
}

// ============================================================================
// Health & Clusters
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn list_clusters(State(state): State<ApiState>) -> impl IntoResponse {
    let summaries: Vec<_> = state.registry.list().iter().map(|c| c.summary()).collect();
    Json(summaries)
}

async fn get_cluster(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(cluster(&state, &name)?.summary()))
}

#[derive(Debug, Serialize)]
struct RederiveResponse {
    cluster: String,
    range: VlanRange,
}

async fn rederive_cluster(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = cluster(&state, &name)?;
    let range = cluster.rederive().await;
    Ok(Json(RederiveResponse {
        cluster: name,
        range,
    }))
}

// ============================================================================
// Token Endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReserveRequest {
    owner: Account,
    network: String,
}

async fn reserve_token(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<ReserveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = cluster(&state, &name)?
        .reserve(&req.owner, &req.network)
        .await?;
    Ok((StatusCode::CREATED, Json(token)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveExistingRequest {
    account_id: String,
    network: String,
    network_uuid: String,
    vlan: VlanTag,
}

async fn reserve_existing(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<ReserveExistingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = cluster(&state, &name)?
        .reserve_existing(&req.account_id, &req.network, &req.network_uuid, req.vlan)
        .await?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn release_token(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(token): Json<NetworkToken>,
) -> Result<impl IntoResponse, ApiError> {
    if token.cluster != name {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Token belongs to cluster {}", token.cluster),
        ));
    }
    let outcome = cluster(&state, &name)?.release(&token).await?;
    Ok(Json(outcome))
}

// ============================================================================
// Address Endpoints
// ============================================================================

async fn report_addresses(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(reports): Json<Vec<ClusterAddress>>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = cluster(&state, &name)?.reconcile_addresses(&reports).await;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrphanEntry {
    address: ClusterAddress,
    count: u32,
}

async fn list_orphans(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entries: Vec<OrphanEntry> = cluster(&state, &name)?
        .orphans()
        .snapshot()
        .into_iter()
        .map(|(address, count)| OrphanEntry { address, count })
        .collect();
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearQuery {
    instance_ip: Option<IpAddr>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    cleared: OrphanState,
}

async fn clear_orphan(
    State(state): State<ApiState>,
    Path((name, address)): Path<(String, IpAddr)>,
    Query(query): Query<ClearQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let key = ClusterAddress::new(address, query.instance_ip);
    match cluster(&state, &name)?.clear_orphan(&key) {
        Some(cleared) => Ok(Json(ClearResponse { cleared })),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No orphan record for {}", key),
        )),
    }
}

// ============================================================================
// Configuration Endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VlanBoundsRequest {
    min_vlan: Option<u16>,
    max_vlan: Option<u16>,
}

async fn update_vlans(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<VlanBoundsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let out_of_range = |v: Option<u16>| v.is_some_and(|v| v == 0 || v > DEFAULT_MAX_VLAN);
    if out_of_range(req.min_vlan) || out_of_range(req.max_vlan) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("VLAN bounds must be within [1, {}]", DEFAULT_MAX_VLAN),
        ));
    }
    if let (Some(min), Some(max)) = (req.min_vlan, req.max_vlan) {
        if min >= max {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("minVlan {} must be below maxVlan {}", min, max),
            ));
        }
    }

    let bounds = VlanBounds::new(req.min_vlan, req.max_vlan);
    state.configurations.set_bounds(&name, bounds.clone());
    Ok(Json(bounds))
}
