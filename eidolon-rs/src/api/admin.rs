//! Admin API handlers
//!
//! Mounted behind the admin middleware; the role claim has already been checked.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::handlers::{parse_route_type, ApiError, ApiResponse, ApiResult, AppState};
use crate::error::EidolonError;
use crate::models::{AsnRoute, Role, Route, RouteGroup, User};
use crate::service::Claims;
use crate::traffic::SystemMetrics;

#[derive(Debug, Deserialize)]
pub struct CreateRouteRequest {
    pub network: String,
    #[serde(rename = "type")]
    pub route_type: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// POST /api/routes
pub async fn create_route(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<CreateRouteRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Route>>), ApiError> {
    let route_type = parse_route_type(req.route_type.as_deref())?;
    let route = state
        .routes
        .create_route(&req.network, route_type, &req.description, Some(claims.user_id))
        .await?;

    info!("Admin {} created route {}", claims.username, route.network);
    Ok((StatusCode::CREATED, ApiResponse::ok(route)))
}

#[derive(Debug, Deserialize)]
pub struct RouteFilter {
    #[serde(rename = "type")]
    pub route_type: Option<String>,
}

/// GET /api/routes?type=
pub async fn list_routes(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RouteFilter>,
) -> ApiResult<Vec<Route>> {
    let route_type = parse_route_type(filter.route_type.as_deref())?;
    Ok(ApiResponse::ok(state.routes.list_routes(route_type).await?))
}

/// DELETE /api/routes/:id
pub async fn delete_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<()> {
    state.routes.delete_route(id).await?;
    Ok(ApiResponse::message("Route deleted"))
}

#[derive(Debug, Deserialize)]
pub struct CreateAsnRouteRequest {
    pub asn: u32,
    #[serde(rename = "type")]
    pub route_type: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// POST /api/routes/asn
pub async fn create_asn_route(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<CreateAsnRouteRequest>,
) -> Result<(StatusCode, Json<ApiResponse<AsnRoute>>), ApiError> {
    let route_type = parse_route_type(req.route_type.as_deref())?;
    let route = state
        .routes
        .create_asn_route(req.asn, route_type, &req.description, Some(claims.user_id))
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(route)))
}

/// GET /api/routes/asn
pub async fn list_asn_routes(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RouteFilter>,
) -> ApiResult<Vec<AsnRoute>> {
    let route_type = parse_route_type(filter.route_type.as_deref())?;
    Ok(ApiResponse::ok(state.routes.list_asn_routes(route_type).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// POST /api/groups
pub async fn create_group(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RouteGroup>>), ApiError> {
    let group = state
        .routes
        .create_group(&req.name, &req.description, Some(claims.user_id))
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(group)))
}

/// GET /api/groups
pub async fn list_groups(State(state): State<Arc<AppState>>) -> ApiResult<Vec<RouteGroup>> {
    Ok(ApiResponse::ok(state.routes.list_groups().await?))
}

#[derive(Debug, Deserialize)]
pub struct GroupRouteRequest {
    pub route_id: i64,
}

/// POST /api/groups/:id/routes
pub async fn add_route_to_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<GroupRouteRequest>,
) -> ApiResult<()> {
    state.routes.add_route_to_group(group_id, req.route_id).await?;
    Ok(ApiResponse::message("Route added to group"))
}

/// DELETE /api/groups/:id/routes/:route_id
pub async fn remove_route_from_group(
    State(state): State<Arc<AppState>>,
    Path((group_id, route_id)): Path<(i64, i64)>,
) -> ApiResult<()> {
    state.routes.remove_route_from_group(group_id, route_id).await?;
    Ok(ApiResponse::message("Route removed from group"))
}

#[derive(Debug, Serialize)]
pub struct Connection {
    pub user_id: i64,
    pub session: String,
}

/// GET /api/connections
pub async fn list_connections(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Connection>> {
    let mut connections: Vec<Connection> = state
        .vpn
        .active_connections()
        .await
        .into_iter()
        .map(|(user_id, session)| Connection { user_id, session })
        .collect();
    connections.sort_by_key(|c| c.user_id);

    Ok(ApiResponse::ok(connections))
}

/// POST /api/connections/:user_id/disconnect
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(user_id): Path<i64>,
) -> ApiResult<()> {
    state.vpn.disconnect_user(user_id).await?;
    info!("Admin {} disconnected user {}", claims.username, user_id);
    Ok(ApiResponse::message("User disconnected"))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_size")]
    pub limit: i64,
}

fn default_page_size() -> i64 {
    100
}

/// GET /api/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Vec<User>> {
    if page.offset < 0 || page.limit <= 0 {
        return Err(EidolonError::invalid("offset must be >= 0 and limit > 0").into());
    }
    Ok(ApiResponse::ok(state.auth.list_users(page.offset, page.limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub role: Option<String>,
    pub traffic_limit: Option<i64>,
}

/// PATCH /api/users/:id
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(user_id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<User> {
    let actor = state.actor(&claims).await?;

    let role = match req.role.as_deref() {
        Some(s) => Some(
            Role::parse(s).ok_or_else(|| EidolonError::invalid(format!("unknown role {:?}", s)))?,
        ),
        None => None,
    };

    let mut user = state.auth.get_user(user_id).await?;
    if let Some(role) = role {
        user = state.auth.set_role(&actor, user_id, role).await?;
    }
    if let Some(limit) = req.traffic_limit {
        user = state.auth.set_traffic_limit(&actor, user_id, limit).await?;
    }

    Ok(ApiResponse::ok(user))
}

/// GET /api/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<SystemMetrics> {
    Ok(ApiResponse::ok(state.monitor.snapshot().await))
}
