//! Control of the external `ocserv` process
//!
//! [`VpnDaemon`] is the seam between the control plane and the tunnel daemon.
//! [`OcservDaemon`] supervises a real process; [`mock::MockDaemon`] is an
//! in-memory double used by tests.

pub mod introspection;
pub mod mock;
pub mod ocserv;
pub mod state;

use async_trait::async_trait;

use crate::error::Result;

pub use introspection::{
    parse_session_list, parse_traffic_fields, OcctlIntrospector, SessionIntrospector,
    SessionTraffic,
};
pub use ocserv::{OcservDaemon, OcservSettings};
pub use state::DaemonState;

#[async_trait]
pub trait VpnDaemon: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn state(&self) -> DaemonState;

    async fn add_route(&self, cidr: &str) -> Result<()>;
    async fn remove_route(&self, cidr: &str) -> Result<()>;
    async fn block_route(&self, cidr: &str) -> Result<()>;
    async fn unblock_route(&self, cidr: &str) -> Result<()>;
    async fn add_asn_route(&self, asn: u32) -> Result<()>;
    async fn remove_asn_route(&self, asn: u32) -> Result<()>;

    /// Session identifiers of connected clients
    async fn active_sessions(&self) -> Result<Vec<String>>;
    async fn session_traffic(&self, name: &str) -> Result<SessionTraffic>;
    async fn disconnect(&self, name: &str) -> Result<()>;
}
