//! Application services shared by the REST API, the bot and the admin CLI

pub mod auth;
pub mod invite;
pub mod vpn;

pub use auth::{has_role, AuthService, Claims, JwtConfig};
pub use invite::{InviteService, InviteTree};
pub use vpn::{VpnService, VpnSettings};
