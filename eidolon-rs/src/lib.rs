//! eidolon: control plane for an OpenConnect (`ocserv`) VPN
//!
//! Eidolon owns the user database, decides which networks each user may
//! reach, supervises the `ocserv` process and cuts off sessions that exceed
//! their traffic quota. Users interact through a REST API and a Telegram bot.
//!
//! # Roles
//!
//! - **admin**: manages users, routes and the daemon
//! - **user**: picks routes and invites others
//! - **vassal**: invited user with a small allowance; without individually
//!   assigned routes it also gets every `default` route
//!
//! # Example
//!
//! ```no_run
//! use eidolon_rs::config::Config;
//! use eidolon_rs::routing::resolve_routes;
//! use eidolon_rs::store::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> eidolon_rs::Result<()> {
//!     let config = Config::default();
//!     let store = SqliteStore::connect(&config.database).await?;
//!
//!     for route in resolve_routes(&store, 1).await? {
//!         println!("{}", route.network);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`models`]: users, routes, invites, traffic and role policy
//! - [`store`]: persistence traits and the SQLite backend
//! - [`routing`]: CIDR handling and per-user route resolution
//! - [`daemon`]: `ocserv` supervision and `occtl` parsing
//! - [`traffic`]: quota enforcement and system metrics
//! - [`cert`]: CA, server and client certificates
//! - [`service`]: authentication, invites and VPN orchestration
//! - [`api`]: REST API
//! - [`bot`]: Telegram bot

pub mod api;
pub mod bot;
pub mod cert;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod models;
pub mod routing;
pub mod service;
pub mod store;
pub mod traffic;

// Re-export commonly used types
pub use config::Config;
pub use error::{EidolonError, Result};
