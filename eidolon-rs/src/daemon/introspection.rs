//! Session introspection through `occtl`
//!
//! The parsers are total: malformed output yields empty lists or zero
//! counters, never errors. Only failing to run the command is an error.

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{EidolonError, Result};

/// Byte counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionTraffic {
    pub rx: u64,
    pub tx: u64,
}

impl SessionTraffic {
    pub fn total(&self) -> u64 {
        self.rx.saturating_add(self.tx)
    }
}

/// Session identifiers from `show users` output: header skipped, first token
/// of every other non-blank line.
pub fn parse_session_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// RX and TX counters from `show user <name>` output
pub fn parse_traffic_fields(output: &str) -> SessionTraffic {
    let mut traffic = SessionTraffic::default();

    for line in output.lines().map(str::trim) {
        if line.starts_with("RX:") {
            traffic.rx = parse_counter(line);
        } else if line.starts_with("TX:") {
            traffic.tx = parse_counter(line);
        }
    }

    traffic
}

fn parse_counter(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .map(|token| token.replace(',', ""))
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}

/// Source of live session data
#[async_trait]
pub trait SessionIntrospector: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<String>>;
    async fn session_traffic(&self, name: &str) -> Result<SessionTraffic>;
    async fn disconnect(&self, name: &str) -> Result<()>;
}

/// Runs the `occtl` binary and parses its text output
pub struct OcctlIntrospector {
    binary: String,
}

impl OcctlIntrospector {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                EidolonError::ExternalProcess(format!("failed to run {}: {}", self.binary, e))
            })?;

        if !output.status.success() {
            return Err(EidolonError::ExternalProcess(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SessionIntrospector for OcctlIntrospector {
    async fn list_sessions(&self) -> Result<Vec<String>> {
        let output = self.run(&["show", "users"]).await?;
        Ok(parse_session_list(&output))
    }

    async fn session_traffic(&self, name: &str) -> Result<SessionTraffic> {
        let output = self.run(&["show", "user", name]).await?;
        Ok(parse_traffic_fields(&output))
    }

    async fn disconnect(&self, name: &str) -> Result<()> {
        self.run(&["disconnect", "user", name]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_list() {
        let output = "id  user  vhost  ip  device\nalice 10.0.0.5 vpns0 ...\n";
        assert_eq!(parse_session_list(output), vec!["alice"]);
    }

    #[test]
    fn test_session_list_header_only() {
        assert!(parse_session_list("id user vhost ip\n").is_empty());
        assert!(parse_session_list("").is_empty());
    }

    #[test]
    fn test_session_list_skips_blank_lines() {
        let output = "header\n\nalice 1\n   \nbob 2\n";
        assert_eq!(parse_session_list(output), vec!["alice", "bob"]);
    }

    #[test]
    fn test_traffic_fields() {
        let output = "Username: alice\n  RX: 1,234 bytes\n  TX: 5,678 bytes\n";
        assert_eq!(parse_traffic_fields(output), SessionTraffic { rx: 1234, tx: 5678 });
    }

    #[test]
    fn test_traffic_fields_missing() {
        assert_eq!(parse_traffic_fields("Username: alice\n"), SessionTraffic::default());
    }

    #[test]
    fn test_traffic_fields_garbage_is_zero() {
        let output = "RX: lots\nTX:\n";
        assert_eq!(parse_traffic_fields(output), SessionTraffic { rx: 0, tx: 0 });
    }

    #[tokio::test]
    async fn test_missing_binary_is_external_error() {
        let occtl = OcctlIntrospector::new("/nonexistent/occtl");
        assert!(matches!(
            occtl.list_sessions().await,
            Err(EidolonError::ExternalProcess(_))
        ));
    }
}
