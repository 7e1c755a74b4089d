//! Traffic accounting and quota enforcement

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::daemon::VpnDaemon;
use crate::store::Store;

/// Default enforcement period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Live mapping of user id to daemon session identifier
#[derive(Default)]
pub struct ActiveConnections {
    sessions: RwLock<HashMap<i64, String>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }

    pub async fn insert(&self, user_id: i64, session: String) {
        self.sessions.write().await.insert(user_id, session);
    }

    pub async fn get(&self, user_id: i64) -> Option<String> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    pub async fn remove(&self, user_id: i64) -> Option<String> {
        self.sessions.write().await.remove(&user_id)
    }

    /// Copy of the current map
    pub async fn snapshot(&self) -> HashMap<i64, String> {
        self.sessions.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// What one enforcement pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub sessions: usize,
    pub samples: usize,
    pub disconnected: Vec<String>,
}

/// Periodically samples session traffic and disconnects users over quota
pub struct TrafficEnforcer {
    store: Arc<dyn Store>,
    daemon: Arc<dyn VpnDaemon>,
    connections: Arc<ActiveConnections>,
    interval: Duration,
}

impl TrafficEnforcer {
    pub fn new(
        store: Arc<dyn Store>,
        daemon: Arc<dyn VpnDaemon>,
        connections: Arc<ActiveConnections>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            daemon,
            connections,
            interval,
        }
    }

    pub fn connections(&self) -> Arc<ActiveConnections> {
        Arc::clone(&self.connections)
    }

    /// One reconciliation pass. Errors are logged, never returned.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let sessions = match self.daemon.active_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("Failed to list active sessions: {}", e);
                return report;
            }
        };
        report.sessions = sessions.len();

        self.connections.clear().await;

        for session in sessions {
            let user = match self.store.get_user_by_username(&session).await {
                Ok(user) => user,
                Err(e) => {
                    warn!("No user for session {}: {}", session, e);
                    continue;
                }
            };

            self.connections.insert(user.id, session.clone()).await;

            let traffic = match self.daemon.session_traffic(&session).await {
                Ok(traffic) => traffic,
                Err(e) => {
                    warn!("Failed to read traffic for {}: {}", session, e);
                    continue;
                }
            };

            let bytes = i64::try_from(traffic.total()).unwrap_or(i64::MAX);
            // A failed sample still gets the quota check against what is stored
            match self.store.log_traffic(user.id, bytes, Utc::now()).await {
                Ok(_) => report.samples += 1,
                Err(e) => error!("Failed to record traffic for {}: {}", session, e),
            }

            if !user.has_traffic_limit() {
                continue;
            }

            let total = match self.store.total_user_traffic(user.id).await {
                Ok(total) => total,
                Err(e) => {
                    error!("Failed to total traffic for {}: {}", session, e);
                    continue;
                }
            };

            if total > user.traffic_limit {
                match self.daemon.disconnect(&session).await {
                    Ok(()) => {
                        info!(
                            "Disconnected {} for exceeding traffic limit ({} > {} bytes)",
                            session, total, user.traffic_limit
                        );
                        report.disconnected.push(session);
                    }
                    Err(e) => error!("Failed to disconnect {}: {}", session, e),
                }
            }
        }

        report
    }

    /// Run until `cancel` fires. A tick in progress completes first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Traffic enforcement started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Traffic enforcement stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    info!(
                        sessions = report.sessions,
                        samples = report.samples,
                        disconnected = report.disconnected.len(),
                        "Traffic tick complete"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::mock::MockDaemon;
    use crate::models::{Role, User};
    use crate::store::{SqliteStore, TrafficRepository, UserRepository};

    async fn setup() -> (Arc<SqliteStore>, Arc<MockDaemon>, TrafficEnforcer) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let daemon = Arc::new(MockDaemon::new());
        let enforcer = TrafficEnforcer::new(
            store.clone(),
            daemon.clone(),
            Arc::new(ActiveConnections::new()),
            Duration::from_millis(20),
        );
        (store, daemon, enforcer)
    }

    #[tokio::test]
    async fn test_sample_is_rx_plus_tx() {
        let (store, daemon, enforcer) = setup().await;
        let alice = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        daemon.connect("alice", 1000, 2000).await;

        let report = enforcer.tick().await;
        assert_eq!(report.samples, 1);

        let samples = store.user_traffic(alice.id, 0, i64::MAX).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes, 3000);
        assert_eq!(enforcer.connections().get(alice.id).await, Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_quota_checked_when_sample_not_recorded() {
        let (store, daemon, enforcer) = setup().await;
        let mut alice = User::new("alice", Role::User);
        alice.traffic_limit = 1000;
        let alice = store.create_user(&alice).await.unwrap();
        store.log_traffic(alice.id, 5000, Utc::now()).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER reject_samples BEFORE INSERT ON user_traffic \
             BEGIN SELECT RAISE(ABORT, 'read only'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        daemon.connect("alice", 10, 10).await;
        let report = enforcer.tick().await;

        assert_eq!(report.samples, 0);
        assert_eq!(report.disconnected, vec!["alice".to_string()]);
        assert_eq!(store.total_user_traffic(alice.id).await.unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_two_ticks_two_samples() {
        let (store, daemon, enforcer) = setup().await;
        let alice = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        daemon.connect("alice", 1000, 2000).await;

        enforcer.tick().await;
        enforcer.tick().await;

        let samples = store.user_traffic(alice.id, 0, i64::MAX).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(store.total_user_traffic(alice.id).await.unwrap(), 6000);
    }

    #[tokio::test]
    async fn test_over_quota_disconnects_once() {
        let (store, daemon, enforcer) = setup().await;
        let mut user = User::new("alice", Role::User);
        user.traffic_limit = 5000;
        let alice = store.create_user(&user).await.unwrap();
        store.log_traffic(alice.id, 4000, Utc::now()).await.unwrap();
        daemon.connect("alice", 1000, 1000).await;

        let report = enforcer.tick().await;
        assert_eq!(report.disconnected, vec!["alice".to_string()]);
        assert_eq!(daemon.disconnected().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_exactly_at_limit_is_not_over() {
        let (store, daemon, enforcer) = setup().await;
        let mut user = User::new("alice", Role::User);
        user.traffic_limit = 3000;
        store.create_user(&user).await.unwrap();
        daemon.connect("alice", 1000, 2000).await;

        assert!(enforcer.tick().await.disconnected.is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_never_disconnects() {
        let (store, daemon, enforcer) = setup().await;
        let alice = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        store.log_traffic(alice.id, i64::MAX / 4, Utc::now()).await.unwrap();
        daemon.connect("alice", 1_000_000, 1_000_000).await;

        enforcer.tick().await;
        assert!(daemon.disconnected().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_skipped() {
        let (store, daemon, enforcer) = setup().await;
        let bob = store.create_user(&User::new("bob", Role::User)).await.unwrap();
        daemon.connect("ghost", 10, 10).await;
        daemon.connect("bob", 10, 10).await;

        let report = enforcer.tick().await;
        assert_eq!(report.sessions, 2);
        assert_eq!(report.samples, 1);

        let snapshot = enforcer.connections().snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&bob.id), Some(&"bob".to_string()));
    }

    #[tokio::test]
    async fn test_listing_failure_skips_tick() {
        let (store, daemon, enforcer) = setup().await;
        let alice = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        daemon.connect("alice", 1, 1).await;
        enforcer.tick().await;

        daemon.fail_session_listing(true).await;
        let report = enforcer.tick().await;
        assert_eq!(report, TickReport::default());

        // Map left as it was; no new samples
        assert_eq!(enforcer.connections().len().await, 1);
        assert_eq!(store.user_traffic(alice.id, 0, i64::MAX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_map_replaced_each_tick() {
        let (store, daemon, enforcer) = setup().await;
        store.create_user(&User::new("alice", Role::User)).await.unwrap();
        daemon.connect("alice", 1, 1).await;
        enforcer.tick().await;
        assert_eq!(enforcer.connections().len().await, 1);

        daemon.disconnect("alice").await.unwrap();
        enforcer.tick().await;
        assert!(enforcer.connections().is_empty().await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (store, daemon, enforcer) = setup().await;
        let alice = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        daemon.connect("alice", 1, 1).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(enforcer).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        handle.await.unwrap();

        let count = store.user_traffic(alice.id, 0, i64::MAX).await.unwrap().len();
        assert!(count >= 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let after = store.user_traffic(alice.id, 0, i64::MAX).await.unwrap().len();
        assert_eq!(count, after);
    }
}
