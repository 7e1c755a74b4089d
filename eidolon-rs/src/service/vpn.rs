//! VPN lifecycle: daemon bootstrap, client certificates, connections and traffic

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cert::CertificateManager;
use crate::daemon::{DaemonState, VpnDaemon};
use crate::error::{EidolonError, Result};
use crate::models::{RouteType, User, UserTraffic};
use crate::store::Store;
use crate::traffic::{ActiveConnections, TickReport, TrafficEnforcer};

/// Static inputs of [`VpnService`]
#[derive(Debug, Clone)]
pub struct VpnSettings {
    pub default_routes: Vec<String>,
    pub default_asn_routes: Vec<u32>,
    pub public_host: String,
    pub public_port: u16,
    pub poll_interval: Duration,
}

pub struct VpnService {
    store: Arc<dyn Store>,
    daemon: Arc<dyn VpnDaemon>,
    certs: Arc<CertificateManager>,
    settings: VpnSettings,
    connections: Arc<ActiveConnections>,
    enforcer: Arc<TrafficEnforcer>,
    enforcement: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl VpnService {
    /// `shutdown` bounds every background task this service spawns
    pub fn new(
        store: Arc<dyn Store>,
        daemon: Arc<dyn VpnDaemon>,
        certs: Arc<CertificateManager>,
        settings: VpnSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let connections = Arc::new(ActiveConnections::new());
        let enforcer = Arc::new(TrafficEnforcer::new(
            Arc::clone(&store),
            Arc::clone(&daemon),
            Arc::clone(&connections),
            settings.poll_interval,
        ));

        Self {
            store,
            daemon,
            certs,
            settings,
            connections,
            enforcer,
            enforcement: Mutex::new(None),
            shutdown,
        }
    }

    pub fn connections(&self) -> Arc<ActiveConnections> {
        Arc::clone(&self.connections)
    }

    pub fn certificates(&self) -> Arc<CertificateManager> {
        Arc::clone(&self.certs)
    }

    pub async fn daemon_state(&self) -> DaemonState {
        self.daemon.state().await
    }

    /// Load route lists into the daemon, start it, then start traffic enforcement.
    /// Route loading failures are logged; a daemon start failure is returned.
    pub async fn start(&self) -> Result<()> {
        self.load_routes().await;

        self.daemon.start().await?;

        let token = self.shutdown.child_token();
        tokio::spawn(Arc::clone(&self.enforcer).run(token.clone()));
        if let Some(previous) = self.enforcement.lock().await.replace(token) {
            previous.cancel();
        }

        info!("VPN service started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(token) = self.enforcement.lock().await.take() {
            token.cancel();
        }
        self.daemon.stop().await?;
        self.connections.clear().await;
        info!("VPN service stopped");
        Ok(())
    }

    /// Stop, then start again with freshly loaded route lists
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn load_routes(&self) {
        for cidr in &self.settings.default_routes {
            if let Err(e) = self.daemon.add_route(cidr).await {
                warn!("Failed to add default route {}: {}", cidr, e);
            }
        }

        for asn in &self.settings.default_asn_routes {
            if let Err(e) = self.daemon.add_asn_route(*asn).await {
                warn!("Failed to add default ASN {}: {}", asn, e);
            }
        }

        match self.store.list_routes(Some(RouteType::Default)).await {
            Ok(routes) => {
                for route in routes {
                    if let Err(e) = self.daemon.add_route(&route.network).await {
                        warn!("Failed to add route {}: {}", route.network, e);
                    }
                }
            }
            Err(e) => warn!("Failed to load default routes: {}", e),
        }

        match self.store.list_routes(Some(RouteType::Blocked)).await {
            Ok(routes) => {
                for route in routes {
                    if let Err(e) = self.daemon.block_route(&route.network).await {
                        warn!("Failed to block route {}: {}", route.network, e);
                    }
                }
            }
            Err(e) => warn!("Failed to load blocked routes: {}", e),
        }

        match self.store.list_asn_routes(None).await {
            Ok(asns) => {
                for asn in asns.iter().filter(|a| a.route_type.is_allowed()) {
                    if let Err(e) = self.daemon.add_asn_route(asn.asn).await {
                        warn!("Failed to add ASN {}: {}", asn.asn, e);
                    }
                }
            }
            Err(e) => warn!("Failed to load ASN routes: {}", e),
        }
    }

    /// One enforcement pass outside the regular schedule
    pub async fn poll_now(&self) -> TickReport {
        self.enforcer.tick().await
    }

    /// Issue a client certificate for the user and store it
    pub async fn create_user_certificate(&self, user_id: i64) -> Result<String> {
        let mut user = self.store.get_user(user_id).await?;
        let pem = self.certs.create_client_certificate(&user.username)?;

        user.certificate = Some(pem.clone());
        self.store.update_user(&user).await?;
        Ok(pem)
    }

    pub async fn user_traffic(&self, user_id: i64, from: i64, to: i64) -> Result<Vec<UserTraffic>> {
        if from > to {
            return Err(EidolonError::invalid("range start is after its end"));
        }
        self.store.user_traffic(user_id, from, to).await
    }

    pub async fn total_user_traffic(&self, user_id: i64) -> Result<i64> {
        self.store.total_user_traffic(user_id).await
    }

    pub async fn total_traffic(&self, from: i64, to: i64) -> Result<i64> {
        self.store.total_traffic(from, to).await
    }

    /// Connections seen by the last enforcement pass: user id → session name
    pub async fn active_connections(&self) -> HashMap<i64, String> {
        self.connections.snapshot().await
    }

    pub async fn disconnect_user(&self, user_id: i64) -> Result<()> {
        let session = self
            .connections
            .get(user_id)
            .await
            .ok_or_else(|| EidolonError::not_found(format!("No active connection for user {}", user_id)))?;

        self.daemon.disconnect(&session).await?;
        self.connections.remove(user_id).await;
        info!("Disconnected {} (user {})", session, user_id);
        Ok(())
    }

    /// OpenConnect client profile for a user holding a certificate
    pub fn client_config(&self, user: &User) -> Result<String> {
        let certificate = user.certificate.as_deref().ok_or_else(|| {
            EidolonError::InvalidState(format!("{} has no certificate yet", user.username))
        })?;

        Ok(format!(
            "# Eidolon VPN OpenConnect profile\n\
             # User: {user}\n\
             # Generated: {generated}\n\
             \n\
             server={host}\n\
             port={port}\n\
             protocol=anyconnect\n\
             user={user}\n\
             authgroup=Eidolon\n\
             \n\
             {certificate}",
            user = user.username,
            generated = Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            host = self.settings.public_host,
            port = self.settings.public_port,
            certificate = certificate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertificateOptions;
    use crate::daemon::mock::MockDaemon;
    use crate::models::{AsnRoute, Role, Route};
    use crate::store::{RouteRepository, SqliteStore, UserRepository};
    use tempfile::TempDir;

    struct Harness {
        store: Arc<SqliteStore>,
        daemon: Arc<MockDaemon>,
        service: VpnService,
        _dir: TempDir,
    }

    async fn setup() -> Harness {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let daemon = Arc::new(MockDaemon::new());
        let dir = TempDir::new().unwrap();
        let certs = CertificateManager::load_or_create(
            dir.path(),
            CertificateOptions {
                ca_common_name: "Test CA".to_string(),
                server_common_name: "vpn.test".to_string(),
                organization: "Test".to_string(),
                country: "NL".to_string(),
            },
        )
        .unwrap();

        let service = VpnService::new(
            store.clone(),
            daemon.clone(),
            Arc::new(certs),
            VpnSettings {
                default_routes: vec!["192.168.1.7/24".to_string(), "bogus".to_string()],
                default_asn_routes: vec![13335],
                public_host: "vpn.test".to_string(),
                public_port: 8443,
                poll_interval: Duration::from_secs(3600),
            },
            CancellationToken::new(),
        );

        Harness {
            store,
            daemon,
            service,
            _dir: dir,
        }
    }

    fn route(network: &str, route_type: RouteType) -> Route {
        Route {
            id: 0,
            network: network.to_string(),
            route_type,
            description: String::new(),
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_loads_route_lists() {
        let h = setup().await;
        h.store.create_route(&route("10.0.0.0/8", RouteType::Default)).await.unwrap();
        h.store.create_route(&route("172.16.0.0/12", RouteType::Custom)).await.unwrap();
        h.store.create_route(&route("8.8.8.0/24", RouteType::Blocked)).await.unwrap();
        h.store
            .create_asn_route(&AsnRoute {
                id: 0,
                asn: 15169,
                route_type: RouteType::Custom,
                description: String::new(),
                created_by: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        h.service.start().await.unwrap();

        assert_eq!(h.service.daemon_state().await, DaemonState::Running);
        assert_eq!(
            h.daemon.routes().await,
            vec!["192.168.1.0/24".to_string(), "10.0.0.0/8".to_string()]
        );
        assert_eq!(h.daemon.blocked_routes().await, vec!["8.8.8.0/24".to_string()]);
        assert_eq!(h.daemon.asn_routes().await, vec![13335, 15169]);

        h.service.stop().await.unwrap();
        assert_eq!(h.service.daemon_state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_restart() {
        let h = setup().await;
        h.service.start().await.unwrap();
        assert!(h.service.start().await.is_err());

        h.service.restart().await.unwrap();
        assert_eq!(h.service.daemon_state().await, DaemonState::Running);
    }

    #[tokio::test]
    async fn test_certificate_and_config() {
        let h = setup().await;
        let user = h.store.create_user(&User::new("alice", Role::User)).await.unwrap();

        assert!(matches!(
            h.service.client_config(&user),
            Err(EidolonError::InvalidState(_))
        ));

        let pem = h.service.create_user_certificate(user.id).await.unwrap();
        let stored = h.store.get_user(user.id).await.unwrap();
        assert_eq!(stored.certificate.as_deref(), Some(pem.as_str()));

        let config = h.service.client_config(&stored).unwrap();
        assert!(config.contains("server=vpn.test"));
        assert!(config.contains("port=8443"));
        assert!(config.contains("user=alice"));
        assert!(config.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_disconnect_requires_connection() {
        let h = setup().await;
        let user = h.store.create_user(&User::new("bob", Role::User)).await.unwrap();

        assert!(matches!(
            h.service.disconnect_user(user.id).await,
            Err(EidolonError::NotFound(_))
        ));

        h.daemon.connect("bob", 10, 20).await;
        let report = h.service.poll_now().await;
        assert_eq!(report.samples, 1);
        assert_eq!(
            h.service.active_connections().await.get(&user.id).map(String::as_str),
            Some("bob")
        );

        h.service.disconnect_user(user.id).await.unwrap();
        assert_eq!(h.daemon.disconnected().await, vec!["bob".to_string()]);
        assert!(h.service.active_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_traffic_queries() {
        let h = setup().await;
        let user = h.store.create_user(&User::new("carol", Role::User)).await.unwrap();
        h.daemon.connect("carol", 1000, 500).await;
        h.service.poll_now().await;

        let now = Utc::now().timestamp();
        let samples = h.service.user_traffic(user.id, now - 60, now + 60).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes, 1500);
        assert_eq!(h.service.total_user_traffic(user.id).await.unwrap(), 1500);
        assert_eq!(h.service.total_traffic(now - 60, now + 60).await.unwrap(), 1500);

        assert!(h.service.user_traffic(user.id, now, now - 1).await.is_err());
    }
}
