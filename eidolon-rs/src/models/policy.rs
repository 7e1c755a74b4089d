//! Role policy: what each role may do

use serde::Serialize;

use super::user::Role;

/// A count limit that may be unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Limit {
    Unlimited,
    Bounded(u32),
}

impl Limit {
    /// True if `used` more items may still be added under this limit
    pub fn allows(&self, used: u32) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Bounded(max) => used < *max,
        }
    }

    /// True if this limit permits anything at all
    pub fn is_zero(&self) -> bool {
        matches!(self, Limit::Bounded(0))
    }

    /// Compare generosity: `Unlimited` is greater than any bound
    pub fn at_least(&self, other: &Limit) -> bool {
        match (self, other) {
            (Limit::Unlimited, _) => true,
            (Limit::Bounded(_), Limit::Unlimited) => false,
            (Limit::Bounded(a), Limit::Bounded(b)) => a >= b,
        }
    }
}

/// Capability set derived from a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleLimits {
    pub max_invites: Limit,
    pub max_vpn_connections: Limit,
    pub can_add_routes: bool,
    pub can_view_logs: bool,
    pub can_manage_users: bool,
    pub can_manage_invites: bool,
    pub can_view_invite_tree: bool,
    pub can_override_admin_routes: bool,
}

impl RoleLimits {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Admin => Self {
                max_invites: Limit::Unlimited,
                max_vpn_connections: Limit::Unlimited,
                can_add_routes: true,
                can_view_logs: true,
                can_manage_users: true,
                can_manage_invites: true,
                can_view_invite_tree: true,
                can_override_admin_routes: true,
            },
            Role::User => Self {
                max_invites: Limit::Bounded(4),
                max_vpn_connections: Limit::Bounded(1),
                can_add_routes: true,
                can_view_logs: false,
                can_manage_users: false,
                can_manage_invites: true,
                can_view_invite_tree: true,
                can_override_admin_routes: false,
            },
            Role::Vassal => Self {
                max_invites: Limit::Bounded(0),
                max_vpn_connections: Limit::Bounded(1),
                ..Self::none()
            },
            Role::Unknown => Self::none(),
        }
    }

    fn none() -> Self {
        Self {
            max_invites: Limit::Bounded(0),
            max_vpn_connections: Limit::Bounded(0),
            can_add_routes: false,
            can_view_logs: false,
            can_manage_users: false,
            can_manage_invites: false,
            can_view_invite_tree: false,
            can_override_admin_routes: false,
        }
    }

    /// True if every capability of `other` is also granted here
    pub fn covers(&self, other: &RoleLimits) -> bool {
        let flags = [
            (self.can_add_routes, other.can_add_routes),
            (self.can_view_logs, other.can_view_logs),
            (self.can_manage_users, other.can_manage_users),
            (self.can_manage_invites, other.can_manage_invites),
            (self.can_view_invite_tree, other.can_view_invite_tree),
            (self.can_override_admin_routes, other.can_override_admin_routes),
        ];

        self.max_invites.at_least(&other.max_invites)
            && self.max_vpn_connections.at_least(&other.max_vpn_connections)
            && flags.iter().all(|(mine, theirs)| *mine || !*theirs)
    }
}
