//! Persistence layer
//!
//! Repository traits per aggregate, grouped by [`Store`]. Every service holds an
//! `Arc<dyn Store>` and re-fetches through it on each operation.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AsnRoute, InviteCode, Route, RouteGroup, RouteType, User, UserTraffic};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user and return it with its assigned id
    async fn create_user(&self, user: &User) -> Result<User>;
    async fn get_user(&self, id: i64) -> Result<User>;
    async fn get_user_by_telegram_id(&self, telegram_id: i64) -> Result<User>;
    async fn get_user_by_username(&self, username: &str) -> Result<User>;
    async fn update_user(&self, user: &User) -> Result<()>;
    async fn delete_user(&self, id: i64) -> Result<()>;
    async fn list_users(&self, offset: i64, limit: i64) -> Result<Vec<User>>;
    async fn count_users_invited_by(&self, inviter_id: i64) -> Result<i64>;
    async fn invited_users(&self, inviter_id: i64) -> Result<Vec<User>>;
}

#[async_trait]
pub trait InviteRepository: Send + Sync {
    async fn create_invite(&self, invite: &InviteCode) -> Result<InviteCode>;
    async fn get_invite_by_code(&self, code: &str) -> Result<InviteCode>;
    async fn get_invite(&self, id: i64) -> Result<InviteCode>;
    async fn update_invite(&self, invite: &InviteCode) -> Result<()>;
    async fn delete_invite(&self, id: i64) -> Result<()>;
    async fn list_invites_by_creator(&self, creator_id: i64) -> Result<Vec<InviteCode>>;
    /// Unused, unexpired invites issued by `creator_id`
    async fn count_active_invites(&self, creator_id: i64) -> Result<u32>;
}

#[async_trait]
pub trait RouteRepository: Send + Sync {
    async fn create_route(&self, route: &Route) -> Result<Route>;
    async fn get_route(&self, id: i64) -> Result<Route>;
    async fn update_route(&self, route: &Route) -> Result<()>;
    async fn delete_route(&self, id: i64) -> Result<()>;
    /// All routes, or only those of `route_type`
    async fn list_routes(&self, route_type: Option<RouteType>) -> Result<Vec<Route>>;

    async fn create_asn_route(&self, route: &AsnRoute) -> Result<AsnRoute>;
    async fn get_asn_route(&self, id: i64) -> Result<AsnRoute>;
    async fn list_asn_routes(&self, route_type: Option<RouteType>) -> Result<Vec<AsnRoute>>;
    async fn delete_asn_route(&self, id: i64) -> Result<()>;

    async fn create_group(&self, group: &RouteGroup) -> Result<RouteGroup>;
    async fn get_group(&self, id: i64) -> Result<RouteGroup>;
    async fn list_groups(&self) -> Result<Vec<RouteGroup>>;
    async fn delete_group(&self, id: i64) -> Result<()>;
    async fn add_route_to_group(&self, group_id: i64, route_id: i64) -> Result<()>;
    async fn remove_route_from_group(&self, group_id: i64, route_id: i64) -> Result<()>;
    async fn routes_in_group(&self, group_id: i64) -> Result<Vec<Route>>;

    /// Upsert a user→route edge; re-assigning updates `enabled`
    async fn assign_route_to_user(&self, user_id: i64, route_id: i64, enabled: bool) -> Result<()>;
    async fn unassign_route_from_user(&self, user_id: i64, route_id: i64) -> Result<()>;
    /// Enabled routes individually assigned to the user
    async fn user_routes(&self, user_id: i64) -> Result<Vec<Route>>;

    /// Upsert a user→group edge; re-assigning updates `enabled`
    async fn assign_group_to_user(&self, user_id: i64, group_id: i64, enabled: bool) -> Result<()>;
    async fn unassign_group_from_user(&self, user_id: i64, group_id: i64) -> Result<()>;
    /// Enabled groups assigned to the user
    async fn user_groups(&self, user_id: i64) -> Result<Vec<RouteGroup>>;
}

#[async_trait]
pub trait TrafficRepository: Send + Sync {
    async fn log_traffic(&self, user_id: i64, bytes: i64, timestamp: DateTime<Utc>)
        -> Result<UserTraffic>;
    /// Samples with `from <= timestamp <= to` (Unix seconds)
    async fn user_traffic(&self, user_id: i64, from: i64, to: i64) -> Result<Vec<UserTraffic>>;
    async fn total_user_traffic(&self, user_id: i64) -> Result<i64>;
    /// Sum over every user in the range
    async fn total_traffic(&self, from: i64, to: i64) -> Result<i64>;
    /// Samples of every user in the range
    async fn traffic_in_range(&self, from: i64, to: i64) -> Result<Vec<UserTraffic>>;
}

/// Everything the services need from persistence
pub trait Store: UserRepository + InviteRepository + RouteRepository + TrafficRepository {}

impl<T> Store for T where T: UserRepository + InviteRepository + RouteRepository + TrafficRepository {}
