//! Effective route computation

use tracing::debug;

use crate::error::Result;
use crate::models::{Role, Route, RouteType};
use crate::store::Store;

/// Compute the routes a user may reach.
///
/// Individual routes come first, then the routes of each assigned group in
/// group order. Duplicates are kept. A vassal with no individual routes also
/// receives every `default` route, even when groups contributed routes.
pub async fn resolve_routes(store: &dyn Store, user_id: i64) -> Result<Vec<Route>> {
    let user = store.get_user(user_id).await?;

    let mut routes = store.user_routes(user_id).await?;
    let individual_count = routes.len();

    for group in store.user_groups(user_id).await? {
        let group_routes = store.routes_in_group(group.id).await?;
        routes.extend(group_routes);
    }

    if user.role == Role::Vassal && individual_count == 0 {
        let defaults = store.list_routes(Some(RouteType::Default)).await?;
        debug!(
            user = %user.username,
            count = defaults.len(),
            "vassal without individual routes, adding default routes"
        );
        routes.extend(defaults);
    }

    Ok(routes)
}
