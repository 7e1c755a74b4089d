//! API Server - HTTP server for REST API

use axum::{
    extract::{ConnectInfo, FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::admin;
use crate::api::handlers::{self, ApiResponse, AppState};
use crate::models::Role;
use crate::service::Claims;

/// Requests per window allowed on the unauthenticated auth endpoints
const AUTH_RATE_LIMIT: u32 = 10;
const AUTH_RATE_WINDOW_SECS: u64 = 60;

/// Rate limiter state for tracking requests per IP
pub struct RateLimiter {
    /// Map of IP -> (request count, window start time)
    requests: RwLock<HashMap<String, (u32, Instant)>>,
    max_requests: u32,
    window_duration: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            max_requests,
            window_duration: Duration::from_secs(window_seconds),
        }
    }

    /// Count a request from `ip`; false once the window's budget is spent
    pub async fn check_rate_limit(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.write().await;

        // Drop stale windows so the map stays bounded by recent clients
        requests.retain(|_, (_, start)| now.duration_since(*start) <= self.window_duration * 2);

        let entry = requests.entry(ip.to_string()).or_insert((0, now));

        if now.duration_since(entry.1) > self.window_duration {
            entry.0 = 0;
            entry.1 = now;
        }

        if entry.0 >= self.max_requests {
            return false;
        }

        entry.0 += 1;
        true
    }
}

pub struct ApiServer {
    state: Arc<AppState>,
    rate_limiter: Arc<RateLimiter>,
    addr: String,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>, addr: String) -> Self {
        Self {
            state,
            rate_limiter: Arc::new(RateLimiter::new(AUTH_RATE_LIMIT, AUTH_RATE_WINDOW_SECS)),
            addr,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let auth_routes = Router::new()
            .route("/auth/register", post(handlers::register))
            .route("/auth/login", post(handlers::login))
            .route_layer(middleware::from_fn_with_state(
                self.rate_limiter.clone(),
                rate_limit_middleware,
            ));

        let public_routes = Router::new()
            .route("/health", get(handlers::health))
            .merge(auth_routes);

        let protected_routes = Router::new()
            .route("/user/info", get(handlers::user_info))
            .route(
                "/user/routes",
                get(handlers::user_routes).post(handlers::add_user_route),
            )
            .route("/user/routes/:route_id", delete(handlers::remove_user_route))
            .route("/user/groups", post(handlers::add_user_group))
            .route("/user/groups/:group_id", delete(handlers::remove_user_group))
            .route("/user/traffic", get(handlers::user_traffic))
            .route("/user/traffic/total", get(handlers::user_traffic_total))
            .route("/user/config", get(handlers::user_config))
            .route(
                "/invites",
                get(handlers::list_invites).post(handlers::create_invite),
            )
            .route("/invites/tree", get(handlers::invite_tree))
            .route("/invites/:id", delete(handlers::delete_invite))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth_middleware,
            ));

        // Layers run last-added first: authenticate, then check the role
        let admin_routes = Router::new()
            .route("/routes", get(admin::list_routes).post(admin::create_route))
            .route(
                "/routes/asn",
                get(admin::list_asn_routes).post(admin::create_asn_route),
            )
            .route("/routes/:id", delete(admin::delete_route))
            .route("/groups", get(admin::list_groups).post(admin::create_group))
            .route("/groups/:id/routes", post(admin::add_route_to_group))
            .route(
                "/groups/:id/routes/:route_id",
                delete(admin::remove_route_from_group),
            )
            .route("/connections", get(admin::list_connections))
            .route("/connections/:user_id/disconnect", post(admin::disconnect))
            .route("/users", get(admin::list_users))
            .route("/users/:id", patch(admin::update_user))
            .route("/metrics", get(admin::metrics))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                admin_middleware,
            ))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth_middleware,
            ));

        Router::new()
            .nest(
                "/api",
                public_routes.merge(protected_routes).merge(admin_routes),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let router = self.router();

        info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("API server stopped");
        Ok(())
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, ApiResponse::failure(message)).into_response()
}

/// Authentication middleware - validates JWT token
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token,
        None => {
            warn!("Missing or invalid Authorization header");
            return unauthorized("Missing or invalid Authorization header");
        }
    };

    match state.auth.validate_token(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => {
            warn!("Invalid JWT token: {}", e);
            unauthorized("Invalid or expired token")
        }
    }
}

/// Admin middleware - requires the admin role claim
async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(claims) = req.extensions().get::<Claims>().cloned() else {
        return unauthorized("Not authenticated");
    };

    // The stored role wins over the one in the token
    let user = match state.actor(&claims).await {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    if user.role != Role::Admin {
        warn!("Non-admin {} denied admin endpoint {}", user.username, req.uri());
        return (
            StatusCode::FORBIDDEN,
            ApiResponse::failure("Administrator role required"),
        )
            .into_response();
    }

    next.run(req).await
}

async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !limiter.check_rate_limit(&ip).await {
        warn!("Rate limit exceeded for {}", ip);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            ApiResponse::failure("Too many requests"),
        )
            .into_response();
    }

    next.run(req).await
}

/// Extract Claims from request (for handlers)
#[axum::async_trait]
impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .ok_or((StatusCode::UNAUTHORIZED, ApiResponse::failure("Not authenticated")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_budget() {
        let limiter = RateLimiter::new(2, 60);
        assert!(limiter.check_rate_limit("1.2.3.4").await);
        assert!(limiter.check_rate_limit("1.2.3.4").await);
        assert!(!limiter.check_rate_limit("1.2.3.4").await);
        assert!(limiter.check_rate_limit("5.6.7.8").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_window_resets() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.check_rate_limit("1.2.3.4").await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(limiter.check_rate_limit("1.2.3.4").await);
    }
}
