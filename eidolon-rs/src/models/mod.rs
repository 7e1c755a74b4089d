//! Domain data model

pub mod invite;
pub mod policy;
pub mod route;
pub mod traffic;
pub mod user;

pub use invite::InviteCode;
pub use policy::{Limit, RoleLimits};
pub use route::{AsnRoute, Route, RouteGroup, RouteType, UserRoute, UserRouteGroup};
pub use traffic::{format_bytes, parse_bytes, period_range, total_bytes, UserTraffic};
pub use user::{Role, User};
