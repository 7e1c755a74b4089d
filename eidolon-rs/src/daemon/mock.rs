//! In-memory daemon for tests

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::introspection::SessionTraffic;
use super::state::DaemonState;
use super::VpnDaemon;
use crate::error::{EidolonError, Result};
use crate::routing::normalize_cidr;

#[derive(Default)]
struct MockState {
    sessions: Vec<String>,
    traffic: HashMap<String, SessionTraffic>,
    fail_sessions: bool,
    disconnected: Vec<String>,
    routes: Vec<String>,
    blocked: Vec<String>,
    asns: Vec<u32>,
    running: bool,
}

/// Scriptable [`VpnDaemon`] that records what it was asked to do
#[derive(Default)]
pub struct MockDaemon {
    state: RwLock<MockState>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live session reporting the given counters
    pub async fn connect(&self, name: &str, rx: u64, tx: u64) {
        let mut state = self.state.write().await;
        if !state.sessions.iter().any(|s| s == name) {
            state.sessions.push(name.to_string());
        }
        state.traffic.insert(name.to_string(), SessionTraffic { rx, tx });
    }

    /// Make `active_sessions` fail until reset
    pub async fn fail_session_listing(&self, fail: bool) {
        self.state.write().await.fail_sessions = fail;
    }

    pub async fn disconnected(&self) -> Vec<String> {
        self.state.read().await.disconnected.clone()
    }

    pub async fn routes(&self) -> Vec<String> {
        self.state.read().await.routes.clone()
    }

    pub async fn blocked_routes(&self) -> Vec<String> {
        self.state.read().await.blocked.clone()
    }

    pub async fn asn_routes(&self) -> Vec<u32> {
        self.state.read().await.asns.clone()
    }
}

fn insert_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

#[async_trait]
impl VpnDaemon for MockDaemon {
    async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.running {
            return Err(EidolonError::InvalidState("already running".to_string()));
        }
        state.running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.write().await.running = false;
        Ok(())
    }

    async fn state(&self) -> DaemonState {
        if self.state.read().await.running {
            DaemonState::Running
        } else {
            DaemonState::Stopped
        }
    }

    async fn add_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        insert_unique(&mut self.state.write().await.routes, cidr);
        Ok(())
    }

    async fn remove_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        self.state.write().await.routes.retain(|r| r != &cidr);
        Ok(())
    }

    async fn block_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        insert_unique(&mut self.state.write().await.blocked, cidr);
        Ok(())
    }

    async fn unblock_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        self.state.write().await.blocked.retain(|r| r != &cidr);
        Ok(())
    }

    async fn add_asn_route(&self, asn: u32) -> Result<()> {
        insert_unique(&mut self.state.write().await.asns, asn);
        Ok(())
    }

    async fn remove_asn_route(&self, asn: u32) -> Result<()> {
        self.state.write().await.asns.retain(|a| *a != asn);
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        if state.fail_sessions {
            return Err(EidolonError::ExternalProcess("occtl unavailable".to_string()));
        }
        Ok(state.sessions.clone())
    }

    async fn session_traffic(&self, name: &str) -> Result<SessionTraffic> {
        self.state
            .read()
            .await
            .traffic
            .get(name)
            .copied()
            .ok_or_else(|| EidolonError::ExternalProcess(format!("no session {}", name)))
    }

    async fn disconnect(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.sessions.retain(|s| s != name);
        state.traffic.remove(name);
        state.disconnected.push(name.to_string());
        Ok(())
    }
}
