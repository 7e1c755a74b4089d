//! API request handlers for authentication and the calling user

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::EidolonError;
use crate::models::{InviteCode, Role, RoleLimits, Route, RouteType, User, UserTraffic};
use crate::routing::RouteService;
use crate::service::{AuthService, Claims, InviteService, InviteTree, VpnService};
use crate::store::Store;
use crate::traffic::SystemMonitor;

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<AuthService>,
    pub invites: Arc<InviteService>,
    pub routes: Arc<RouteService>,
    pub vpn: Arc<VpnService>,
    pub monitor: Arc<SystemMonitor>,
}

impl AppState {
    /// The caller as currently stored; tokens may carry a stale role
    pub(crate) async fn actor(&self, claims: &Claims) -> Result<User, ApiError> {
        self.store
            .get_user(claims.user_id)
            .await
            .map_err(|e| match e {
                EidolonError::NotFound(_) => ApiError(EidolonError::AuthenticationFailed),
                other => ApiError(other),
            })
    }
}

/// Envelope of every JSON response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
            data: None,
            error: None,
        })
    }

    pub fn failure(error: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: None,
            data: None,
            error: Some(error.into()),
        })
    }
}

/// Error returned by handlers, rendered with a status derived from the error kind
#[derive(Debug)]
pub struct ApiError(pub EidolonError);

impl From<EidolonError> for ApiError {
    fn from(e: EidolonError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EidolonError::NotFound(_) => StatusCode::NOT_FOUND,
            EidolonError::InvalidInput(_) | EidolonError::Parse(_) => StatusCode::BAD_REQUEST,
            EidolonError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            EidolonError::InvalidState(_) => StatusCode::CONFLICT,
            EidolonError::ExternalProcess(_) => StatusCode::BAD_GATEWAY,
            EidolonError::AuthenticationFailed | EidolonError::Token(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        (status, ApiResponse::failure(message)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Session names and certificate CNs are derived from usernames
pub(crate) fn validate_username(username: &str) -> Result<&str, ApiError> {
    let username = username.trim();
    let valid = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(username)
    } else {
        Err(EidolonError::invalid("username must be 1-64 characters of [A-Za-z0-9._-]").into())
    }
}

pub(crate) fn parse_route_type(value: Option<&str>) -> Result<Option<RouteType>, ApiError> {
    match value {
        None => Ok(None),
        Some(s) => RouteType::from_db_string(s)
            .map(Some)
            .ok_or_else(|| EidolonError::invalid(format!("unknown route type {:?}", s)).into()),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub daemon: String,
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthResponse>> {
    ApiResponse::ok(HealthResponse {
        status: "ok",
        daemon: state.vpn.daemon_state().await.to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub invite_code: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: User,
    pub certificate: String,
    pub token: String,
}

/// POST /api/auth/register - Redeem an invite and receive a certificate
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RegisterResponse>>), ApiError> {
    let username = validate_username(&req.username)?;

    let user = state
        .invites
        .use_invite(&req.invite_code, User::new(username, Role::Unknown))
        .await?;
    let certificate = state.vpn.create_user_certificate(user.id).await?;
    let user = state.store.get_user(user.id).await?;
    let token = state.auth.generate_token(&user)?;

    info!("Registered {} through the API", user.username);

    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(RegisterResponse {
            user,
            certificate,
            token,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub certificate: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

/// POST /api/auth/login - Authenticate with a client certificate
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let user = state.auth.authenticate_with_certificate(&req.certificate).await?;
    let token = state.auth.generate_token(&user)?;
    Ok(ApiResponse::ok(LoginResponse { token, user }))
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub user: User,
    pub limits: RoleLimits,
    pub total_traffic: i64,
    pub connected: bool,
}

/// GET /api/user/info
pub async fn user_info(State(state): State<Arc<AppState>>, claims: Claims) -> ApiResult<UserInfo> {
    let user = state.actor(&claims).await?;
    let total_traffic = state.vpn.total_user_traffic(user.id).await?;
    let connected = state.vpn.active_connections().await.contains_key(&user.id);

    Ok(ApiResponse::ok(UserInfo {
        limits: user.limits(),
        user,
        total_traffic,
        connected,
    }))
}

/// GET /api/user/routes - Effective routes of the caller
pub async fn user_routes(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> ApiResult<Vec<Route>> {
    let routes = state.routes.resolve(claims.user_id).await?;
    Ok(ApiResponse::ok(routes))
}

#[derive(Debug, Deserialize)]
pub struct AssignRouteRequest {
    pub route_id: i64,
}

/// POST /api/user/routes
pub async fn add_user_route(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<AssignRouteRequest>,
) -> ApiResult<()> {
    let actor = state.actor(&claims).await?;
    state.routes.assign_route(&actor, actor.id, req.route_id).await?;
    Ok(ApiResponse::message("Route assigned"))
}

/// DELETE /api/user/routes/:route_id
pub async fn remove_user_route(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(route_id): Path<i64>,
) -> ApiResult<()> {
    let actor = state.actor(&claims).await?;
    state.routes.unassign_route(&actor, actor.id, route_id).await?;
    Ok(ApiResponse::message("Route removed"))
}

#[derive(Debug, Deserialize)]
pub struct AssignGroupRequest {
    pub group_id: i64,
}

/// POST /api/user/groups
pub async fn add_user_group(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(req): Json<AssignGroupRequest>,
) -> ApiResult<()> {
    let actor = state.actor(&claims).await?;
    state.routes.assign_group(&actor, actor.id, req.group_id).await?;
    Ok(ApiResponse::message("Group assigned"))
}

/// DELETE /api/user/groups/:group_id
pub async fn remove_user_group(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(group_id): Path<i64>,
) -> ApiResult<()> {
    let actor = state.actor(&claims).await?;
    state.routes.unassign_group(&actor, actor.id, group_id).await?;
    Ok(ApiResponse::message("Group removed"))
}

#[derive(Debug, Deserialize)]
pub struct TrafficQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TrafficResponse {
    pub from: i64,
    pub to: i64,
    pub total: i64,
    pub samples: Vec<UserTraffic>,
}

/// GET /api/user/traffic?from&to - Defaults to the last 30 days
pub async fn user_traffic(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Query(query): Query<TrafficQuery>,
) -> ApiResult<TrafficResponse> {
    let now = Utc::now();
    let to = query.to.unwrap_or_else(|| now.timestamp());
    let from = query
        .from
        .unwrap_or_else(|| (now - Duration::days(30)).timestamp());

    let samples = state.vpn.user_traffic(claims.user_id, from, to).await?;
    let total = samples.iter().map(|s| s.bytes).sum();

    Ok(ApiResponse::ok(TrafficResponse {
        from,
        to,
        total,
        samples,
    }))
}

#[derive(Debug, Serialize)]
pub struct TrafficTotal {
    pub bytes: i64,
    pub limit: i64,
}

/// GET /api/user/traffic/total
pub async fn user_traffic_total(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> ApiResult<TrafficTotal> {
    let user = state.actor(&claims).await?;
    let bytes = state.vpn.total_user_traffic(user.id).await?;
    Ok(ApiResponse::ok(TrafficTotal {
        bytes,
        limit: user.traffic_limit,
    }))
}

/// GET /api/user/config - OpenConnect profile as plain text
pub async fn user_config(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> Result<Response, ApiError> {
    let user = state.actor(&claims).await?;
    let config = state.vpn.client_config(&user)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"eidolon_{}.conf\"", user.username),
            ),
        ],
        config,
    )
        .into_response())
}

/// GET /api/invites
pub async fn list_invites(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> ApiResult<Vec<InviteCode>> {
    let invites = state.invites.list(claims.user_id).await?;
    Ok(ApiResponse::ok(invites))
}

/// POST /api/invites
pub async fn create_invite(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> Result<(StatusCode, Json<ApiResponse<InviteCode>>), ApiError> {
    let invite = state.invites.generate(claims.user_id).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(invite)))
}

/// DELETE /api/invites/:id
pub async fn delete_invite(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<i64>,
) -> ApiResult<()> {
    state.invites.delete(id, claims.user_id).await?;
    Ok(ApiResponse::message("Invite deleted"))
}

/// GET /api/invites/tree
pub async fn invite_tree(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> ApiResult<InviteTree> {
    let tree = state.invites.tree(claims.user_id).await?;
    Ok(ApiResponse::ok(tree))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EidolonError::not_found("x"), StatusCode::NOT_FOUND),
            (EidolonError::invalid("x"), StatusCode::BAD_REQUEST),
            (EidolonError::denied("x"), StatusCode::FORBIDDEN),
            (EidolonError::InvalidState("x".into()), StatusCode::CONFLICT),
            (EidolonError::ExternalProcess("x".into()), StatusCode::BAD_GATEWAY),
            (EidolonError::AuthenticationFailed, StatusCode::UNAUTHORIZED),
            (EidolonError::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError(error).status(), status);
        }
    }

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username(" alice ").unwrap(), "alice");
        assert!(validate_username("bob.smith-2_x").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("a b").is_err());
        assert!(validate_username("eve/../root").is_err());
    }

    #[test]
    fn test_parse_route_type() {
        assert_eq!(parse_route_type(None).unwrap(), None);
        assert_eq!(parse_route_type(Some("block")).unwrap(), Some(RouteType::Blocked));
        assert!(parse_route_type(Some("weird")).is_err());
    }
}
