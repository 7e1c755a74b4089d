//! Route administration
//!
//! Store mutations followed by daemon list updates. Composite operations are
//! not transactional: a failure half way leaves the earlier rows in place.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::cidr::normalize_cidr;
use super::resolver::resolve_routes;
use crate::daemon::VpnDaemon;
use crate::error::{EidolonError, Result};
use crate::models::{AsnRoute, Route, RouteGroup, RouteType, User};
use crate::store::Store;

pub struct RouteService {
    store: Arc<dyn Store>,
    daemon: Arc<dyn VpnDaemon>,
}

impl RouteService {
    pub fn new(store: Arc<dyn Store>, daemon: Arc<dyn VpnDaemon>) -> Self {
        Self { store, daemon }
    }

    /// Effective routes of a user
    pub async fn resolve(&self, user_id: i64) -> Result<Vec<Route>> {
        resolve_routes(self.store.as_ref(), user_id).await
    }

    async fn push(&self, route: &Route) -> Result<()> {
        match route.route_type {
            RouteType::Default | RouteType::Custom => self.daemon.add_route(&route.network).await,
            RouteType::Blocked => self.daemon.block_route(&route.network).await,
            RouteType::Asn => Ok(()),
        }
    }

    /// Drop `route` from the daemon unless another stored row still lists its network.
    /// Call after the store change.
    async fn pull(&self, route: &Route) -> Result<()> {
        let shared = match route.route_type {
            RouteType::Default | RouteType::Custom => {
                let mut rows = self.store.list_routes(Some(RouteType::Default)).await?;
                rows.extend(self.store.list_routes(Some(RouteType::Custom)).await?);
                rows
            }
            RouteType::Blocked => self.store.list_routes(Some(RouteType::Blocked)).await?,
            RouteType::Asn => return Ok(()),
        };

        if shared.iter().any(|r| r.network == route.network) {
            info!("Keeping {} on the daemon, still used by another route", route.network);
            return Ok(());
        }

        match route.route_type {
            RouteType::Default | RouteType::Custom => self.daemon.remove_route(&route.network).await,
            RouteType::Blocked => self.daemon.unblock_route(&route.network).await,
            RouteType::Asn => Ok(()),
        }
    }

    /// Create a route; the network is normalized and the type defaults to custom
    pub async fn create_route(
        &self,
        network: &str,
        route_type: Option<RouteType>,
        description: &str,
        created_by: Option<i64>,
    ) -> Result<Route> {
        let route = Route {
            id: 0,
            network: normalize_cidr(network)?,
            route_type: route_type.unwrap_or(RouteType::Custom),
            description: description.to_string(),
            created_by,
            created_at: Utc::now(),
        };

        let route = self.store.create_route(&route).await?;
        self.push(&route).await?;

        info!("Created {} route {} ({})", route.route_type, route.network, route.id);
        Ok(route)
    }

    pub async fn get_route(&self, id: i64) -> Result<Route> {
        self.store.get_route(id).await
    }

    pub async fn update_route(
        &self,
        id: i64,
        network: Option<&str>,
        route_type: Option<RouteType>,
        description: Option<&str>,
    ) -> Result<Route> {
        let old = self.store.get_route(id).await?;
        let mut route = old.clone();

        if let Some(network) = network {
            route.network = normalize_cidr(network)?;
        }
        if let Some(route_type) = route_type {
            route.route_type = route_type;
        }
        if let Some(description) = description {
            route.description = description.to_string();
        }

        self.store.update_route(&route).await?;

        if old.network != route.network || old.route_type != route.route_type {
            self.pull(&old).await?;
            self.push(&route).await?;
        }

        Ok(route)
    }

    pub async fn delete_route(&self, id: i64) -> Result<()> {
        let route = self.store.get_route(id).await?;
        self.store.delete_route(id).await?;
        self.pull(&route).await?;

        info!("Deleted route {} ({})", route.network, id);
        Ok(())
    }

    pub async fn list_routes(&self, route_type: Option<RouteType>) -> Result<Vec<Route>> {
        self.store.list_routes(route_type).await
    }

    /// Create an ASN route; the type defaults to asn
    pub async fn create_asn_route(
        &self,
        asn: u32,
        route_type: Option<RouteType>,
        description: &str,
        created_by: Option<i64>,
    ) -> Result<AsnRoute> {
        if asn == 0 {
            return Err(EidolonError::invalid("ASN must be positive"));
        }

        let route = AsnRoute {
            id: 0,
            asn,
            route_type: route_type.unwrap_or(RouteType::Asn),
            description: description.to_string(),
            created_by,
            created_at: Utc::now(),
        };

        let route = self.store.create_asn_route(&route).await?;
        if route.route_type.is_allowed() {
            self.daemon.add_asn_route(route.asn).await?;
        }

        info!("Created ASN route AS{} ({})", route.asn, route.id);
        Ok(route)
    }

    pub async fn get_asn_route(&self, id: i64) -> Result<AsnRoute> {
        self.store.get_asn_route(id).await
    }

    pub async fn list_asn_routes(&self, route_type: Option<RouteType>) -> Result<Vec<AsnRoute>> {
        self.store.list_asn_routes(route_type).await
    }

    pub async fn delete_asn_route(&self, id: i64) -> Result<()> {
        let route = self.store.get_asn_route(id).await?;
        self.store.delete_asn_route(id).await?;
        self.daemon.remove_asn_route(route.asn).await
    }

    pub async fn create_group(
        &self,
        name: &str,
        description: &str,
        created_by: Option<i64>,
    ) -> Result<RouteGroup> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EidolonError::invalid("Group name must not be empty"));
        }

        let group = RouteGroup {
            id: 0,
            name: name.to_string(),
            description: description.to_string(),
            created_by,
            created_at: Utc::now(),
        };

        self.store.create_group(&group).await
    }

    pub async fn get_group(&self, id: i64) -> Result<RouteGroup> {
        self.store.get_group(id).await
    }

    pub async fn list_groups(&self) -> Result<Vec<RouteGroup>> {
        self.store.list_groups().await
    }

    pub async fn delete_group(&self, id: i64) -> Result<()> {
        self.store.delete_group(id).await
    }

    /// Add a route to a group; both must exist
    pub async fn add_route_to_group(&self, group_id: i64, route_id: i64) -> Result<()> {
        self.store.get_group(group_id).await?;
        self.store.get_route(route_id).await?;
        self.store.add_route_to_group(group_id, route_id).await
    }

    pub async fn remove_route_from_group(&self, group_id: i64, route_id: i64) -> Result<()> {
        self.store.remove_route_from_group(group_id, route_id).await
    }

    pub async fn routes_in_group(&self, group_id: i64) -> Result<Vec<Route>> {
        self.store.get_group(group_id).await?;
        self.store.routes_in_group(group_id).await
    }

    pub async fn user_groups(&self, user_id: i64) -> Result<Vec<RouteGroup>> {
        self.store.user_groups(user_id).await
    }

    /// The actor needs `can_add_routes`, and `can_manage_users` to act on someone else
    fn check_assign(actor: &User, user_id: i64) -> Result<()> {
        let limits = actor.limits();
        if !limits.can_add_routes {
            return Err(EidolonError::denied(format!(
                "{} may not manage routes",
                actor.username
            )));
        }
        if actor.id != user_id && !limits.can_manage_users {
            return Err(EidolonError::denied(format!(
                "{} may not manage routes of other users",
                actor.username
            )));
        }
        Ok(())
    }

    pub async fn assign_route(&self, actor: &User, user_id: i64, route_id: i64) -> Result<()> {
        self.set_route_enabled(actor, user_id, route_id, true).await
    }

    /// Upsert the assignment with the given flag; `false` is a soft removal
    pub async fn set_route_enabled(
        &self,
        actor: &User,
        user_id: i64,
        route_id: i64,
        enabled: bool,
    ) -> Result<()> {
        Self::check_assign(actor, user_id)?;
        self.store.get_user(user_id).await?;
        let route = self.store.get_route(route_id).await?;

        if route.route_type == RouteType::Blocked && !actor.limits().can_override_admin_routes {
            return Err(EidolonError::denied("Blocked routes cannot be assigned"));
        }

        self.store.assign_route_to_user(user_id, route_id, enabled).await
    }

    pub async fn unassign_route(&self, actor: &User, user_id: i64, route_id: i64) -> Result<()> {
        Self::check_assign(actor, user_id)?;
        self.store.unassign_route_from_user(user_id, route_id).await
    }

    pub async fn assign_group(&self, actor: &User, user_id: i64, group_id: i64) -> Result<()> {
        self.set_group_enabled(actor, user_id, group_id, true).await
    }

    pub async fn set_group_enabled(
        &self,
        actor: &User,
        user_id: i64,
        group_id: i64,
        enabled: bool,
    ) -> Result<()> {
        Self::check_assign(actor, user_id)?;
        self.store.get_user(user_id).await?;
        self.store.get_group(group_id).await?;
        self.store.assign_group_to_user(user_id, group_id, enabled).await
    }

    pub async fn unassign_group(&self, actor: &User, user_id: i64, group_id: i64) -> Result<()> {
        Self::check_assign(actor, user_id)?;
        self.store.unassign_group_from_user(user_id, group_id).await
    }

    /// Create a custom route and assign it to the actor
    pub async fn create_and_assign_route(
        &self,
        actor: &User,
        network: &str,
        description: &str,
    ) -> Result<Route> {
        Self::check_assign(actor, actor.id)?;

        let route = self
            .create_route(network, Some(RouteType::Custom), description, Some(actor.id))
            .await?;

        if let Err(e) = self.store.assign_route_to_user(actor.id, route.id, true).await {
            warn!(
                "Route {} created but not assigned to {}: {}",
                route.id, actor.username, e
            );
            return Err(e);
        }

        Ok(route)
    }
}
