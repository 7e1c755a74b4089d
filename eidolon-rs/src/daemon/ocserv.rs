//! `ocserv` process supervision

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, RwLock};
use tracing::{error, info, warn};

use super::introspection::{SessionIntrospector, SessionTraffic};
use super::state::DaemonState;
use super::VpnDaemon;
use crate::error::{EidolonError, Result};
use crate::routing::normalize_cidr;

/// Time the process gets to exit after SIGTERM
pub const STOP_GRACE: Duration = Duration::from_secs(5);

const KILL_WAIT: Duration = Duration::from_secs(2);

/// How to launch `ocserv`
#[derive(Debug, Clone)]
pub struct OcservSettings {
    pub binary: String,
    pub listen_ip: String,
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
}

struct RunningProcess {
    pid: Option<u32>,
    exited: oneshot::Receiver<()>,
}

struct Inner {
    state: DaemonState,
    routes: Vec<String>,
    blocked: Vec<String>,
    asns: Vec<u32>,
    process: Option<RunningProcess>,
    stop_requested: bool,
}

pub struct OcservDaemon {
    settings: OcservSettings,
    introspector: Arc<dyn SessionIntrospector>,
    inner: Arc<RwLock<Inner>>,
}

impl OcservDaemon {
    pub fn new(settings: OcservSettings, introspector: Arc<dyn SessionIntrospector>) -> Self {
        Self {
            settings,
            introspector,
            inner: Arc::new(RwLock::new(Inner {
                state: DaemonState::Stopped,
                routes: Vec::new(),
                blocked: Vec::new(),
                asns: Vec::new(),
                process: None,
                stop_requested: false,
            })),
        }
    }

    /// Command-line arguments for the current route lists
    pub async fn build_args(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        self.args_for(&inner)
    }

    fn args_for(&self, inner: &Inner) -> Vec<String> {
        let s = &self.settings;
        let mut args = vec![
            format!("--listen={}", s.listen_ip),
            format!("--port={}", s.port),
            format!("--certificate={}", s.cert_path.display()),
            format!("--key={}", s.key_path.display()),
        ];

        if let Some(ca) = &s.ca_path {
            args.push(format!("--cafile={}", ca.display()));
        }

        args.extend(inner.routes.iter().map(|r| format!("--route={}", r)));
        args.extend(inner.blocked.iter().map(|r| format!("--no-route={}", r)));
        args
    }

    pub async fn routes(&self) -> Vec<String> {
        self.inner.read().await.routes.clone()
    }

    pub async fn blocked_routes(&self) -> Vec<String> {
        self.inner.read().await.blocked.clone()
    }

    pub async fn asn_routes(&self) -> Vec<u32> {
        self.inner.read().await.asns.clone()
    }

    fn note_restart(inner: &Inner, what: &str) {
        if inner.state.is_running() {
            info!("{} changed; restart ocserv to apply", what);
        }
    }

    fn spawn_output_readers(child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "ocserv", "{}", line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "ocserv", "{}", line);
                }
            });
        }
    }

    fn spawn_exit_watcher(&self, mut child: Child, exited: oneshot::Sender<()>) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let status = child.wait().await;

            {
                let mut inner = inner.write().await;
                inner.process = None;

                if inner.stop_requested {
                    if inner.state == DaemonState::Stopping {
                        let _ = inner.state.transition(DaemonState::Stopped);
                    }
                } else {
                    match &status {
                        Ok(status) => error!("ocserv exited unexpectedly: {}", status),
                        Err(e) => error!("ocserv wait failed: {}", e),
                    }
                    let _ = inner.state.transition(DaemonState::Crashed);
                }
            }

            let _ = exited.send(());
        });
    }

    fn signal(pid: Option<u32>, signal: Signal) {
        let Some(pid) = pid else { return };
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            warn!("Failed to send {:?} to ocserv ({}): {}", signal, pid, e);
        }
    }
}

#[async_trait]
impl VpnDaemon for OcservDaemon {
    async fn start(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.state.transition(DaemonState::Starting)?;

        let args = self.args_for(&inner);
        info!("Starting {} {}", self.settings.binary, args.join(" "));

        let spawned = Command::new(&self.settings.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                inner.state.transition(DaemonState::Stopped)?;
                return Err(EidolonError::ExternalProcess(format!(
                    "failed to start {}: {}",
                    self.settings.binary, e
                )));
            }
        };

        Self::spawn_output_readers(&mut child);

        let (exit_tx, exit_rx) = oneshot::channel();
        inner.process = Some(RunningProcess {
            pid: child.id(),
            exited: exit_rx,
        });
        inner.stop_requested = false;
        inner.state.transition(DaemonState::Running)?;

        info!("ocserv started (pid {:?})", child.id());
        self.spawn_exit_watcher(child, exit_tx);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let process = {
            let mut inner = self.inner.write().await;
            if !inner.state.is_running() {
                return Ok(());
            }
            inner.state.transition(DaemonState::Stopping)?;
            inner.stop_requested = true;
            inner.process.take()
        };

        if let Some(mut process) = process {
            info!("Stopping ocserv");
            Self::signal(process.pid, Signal::SIGTERM);

            if tokio::time::timeout(STOP_GRACE, &mut process.exited).await.is_err() {
                warn!("ocserv did not exit within {:?}, killing", STOP_GRACE);
                Self::signal(process.pid, Signal::SIGKILL);
                let _ = tokio::time::timeout(KILL_WAIT, process.exited).await;
            }
        }

        let mut inner = self.inner.write().await;
        inner.process = None;
        if inner.state == DaemonState::Stopping {
            inner.state.transition(DaemonState::Stopped)?;
        }
        info!("ocserv stopped");
        Ok(())
    }

    async fn state(&self) -> DaemonState {
        self.inner.read().await.state
    }

    async fn add_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        let mut inner = self.inner.write().await;
        if !inner.routes.contains(&cidr) {
            inner.routes.push(cidr);
            Self::note_restart(&inner, "Route list");
        }
        Ok(())
    }

    async fn remove_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        let mut inner = self.inner.write().await;
        let before = inner.routes.len();
        inner.routes.retain(|r| r != &cidr);
        if inner.routes.len() != before {
            Self::note_restart(&inner, "Route list");
        }
        Ok(())
    }

    async fn block_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        let mut inner = self.inner.write().await;
        if !inner.blocked.contains(&cidr) {
            inner.blocked.push(cidr);
            Self::note_restart(&inner, "Block list");
        }
        Ok(())
    }

    async fn unblock_route(&self, cidr: &str) -> Result<()> {
        let cidr = normalize_cidr(cidr)?;
        let mut inner = self.inner.write().await;
        let before = inner.blocked.len();
        inner.blocked.retain(|r| r != &cidr);
        if inner.blocked.len() != before {
            Self::note_restart(&inner, "Block list");
        }
        Ok(())
    }

    async fn add_asn_route(&self, asn: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.asns.contains(&asn) {
            inner.asns.push(asn);
            Self::note_restart(&inner, "ASN list");
        }
        Ok(())
    }

    async fn remove_asn_route(&self, asn: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let before = inner.asns.len();
        inner.asns.retain(|a| *a != asn);
        if inner.asns.len() != before {
            Self::note_restart(&inner, "ASN list");
        }
        Ok(())
    }

    // Stat reads hold the read lock so they never overlap a route change or restart
    async fn active_sessions(&self) -> Result<Vec<String>> {
        let _inner = self.inner.read().await;
        self.introspector.list_sessions().await
    }

    async fn session_traffic(&self, name: &str) -> Result<SessionTraffic> {
        let _inner = self.inner.read().await;
        self.introspector.session_traffic(name).await
    }

    async fn disconnect(&self, name: &str) -> Result<()> {
        let _inner = self.inner.read().await;
        self.introspector.disconnect(name).await?;
        info!("Disconnected session {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::OcctlIntrospector;

    fn daemon(binary: &str) -> OcservDaemon {
        OcservDaemon::new(
            OcservSettings {
                binary: binary.to_string(),
                listen_ip: "0.0.0.0".to_string(),
                port: 443,
                cert_path: PathBuf::from("/certs/server.crt"),
                key_path: PathBuf::from("/certs/server.key"),
                ca_path: Some(PathBuf::from("/certs/ca.crt")),
            },
            Arc::new(OcctlIntrospector::new("occtl")),
        )
    }

    #[tokio::test]
    async fn test_args_include_routes_and_blocks() {
        let d = daemon("ocserv");
        d.add_route("10.0.0.7/24").await.unwrap();
        d.block_route("192.168.0.0/16").await.unwrap();

        let args = d.build_args().await;
        assert_eq!(
            args,
            vec![
                "--listen=0.0.0.0",
                "--port=443",
                "--certificate=/certs/server.crt",
                "--key=/certs/server.key",
                "--cafile=/certs/ca.crt",
                "--route=10.0.0.0/24",
                "--no-route=192.168.0.0/16",
            ]
        );
    }

    #[tokio::test]
    async fn test_route_mutations_are_idempotent() {
        let d = daemon("ocserv");
        d.add_route("10.0.0.0/24").await.unwrap();
        d.add_route("10.0.0.0/24").await.unwrap();
        assert_eq!(d.routes().await, vec!["10.0.0.0/24"]);

        d.remove_route("172.16.0.0/12").await.unwrap();
        assert_eq!(d.routes().await.len(), 1);

        d.remove_route("10.0.0.0/24").await.unwrap();
        assert!(d.routes().await.is_empty());

        d.add_asn_route(13335).await.unwrap();
        d.add_asn_route(13335).await.unwrap();
        assert_eq!(d.asn_routes().await, vec![13335]);
        d.remove_asn_route(15169).await.unwrap();
        assert_eq!(d.asn_routes().await, vec![13335]);
    }

    #[tokio::test]
    async fn test_invalid_cidr_rejected() {
        let d = daemon("ocserv");
        assert!(matches!(
            d.add_route("not-a-cidr").await,
            Err(EidolonError::InvalidInput(_))
        ));
        assert!(d.block_route("300.0.0.0/8").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let d = daemon("ocserv");
        d.stop().await.unwrap();
        assert_eq!(d.state().await, DaemonState::Stopped);
    }

    /// Blocks `list_sessions` until released
    #[derive(Default)]
    struct GatedIntrospector {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl SessionIntrospector for GatedIntrospector {
        async fn list_sessions(&self) -> Result<Vec<String>> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec!["alice".to_string()])
        }

        async fn session_traffic(&self, _name: &str) -> Result<SessionTraffic> {
            Ok(SessionTraffic { rx: 1, tx: 2 })
        }

        async fn disconnect(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_route_change_waits_for_session_listing() {
        let gate = Arc::new(GatedIntrospector::default());
        let d = Arc::new(OcservDaemon::new(
            OcservSettings {
                binary: "ocserv".to_string(),
                listen_ip: "0.0.0.0".to_string(),
                port: 443,
                cert_path: PathBuf::from("/certs/server.crt"),
                key_path: PathBuf::from("/certs/server.key"),
                ca_path: None,
            },
            gate.clone(),
        ));

        let listing = tokio::spawn({
            let d = d.clone();
            async move { d.active_sessions().await }
        });
        gate.entered.notified().await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), d.add_route("10.0.0.0/8")).await;
        assert!(blocked.is_err());

        gate.release.notify_one();
        assert_eq!(listing.await.unwrap().unwrap(), vec!["alice".to_string()]);

        d.add_route("10.0.0.0/8").await.unwrap();
        assert_eq!(d.routes().await, vec!["10.0.0.0/8"]);
        assert_eq!(d.session_traffic("alice").await.unwrap().total(), 3);
    }

    #[tokio::test]
    async fn test_failed_spawn_returns_to_stopped() {
        let d = daemon("/nonexistent/ocserv");
        assert!(matches!(d.start().await, Err(EidolonError::ExternalProcess(_))));
        assert_eq!(d.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_crash() {
        // `true` ignores its arguments and exits immediately
        let d = daemon("true");
        d.start().await.unwrap();

        for _ in 0..50 {
            if d.state().await == DaemonState::Crashed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(d.state().await, DaemonState::Crashed);

        // Restart from crashed is allowed
        d.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_rejected_and_stop_terminates() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ocserv");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let d = daemon(script.to_str().unwrap());
        d.start().await.unwrap();
        assert_eq!(d.state().await, DaemonState::Running);
        assert!(matches!(d.start().await, Err(EidolonError::InvalidState(_))));

        d.stop().await.unwrap();
        assert_eq!(d.state().await, DaemonState::Stopped);
    }
}
