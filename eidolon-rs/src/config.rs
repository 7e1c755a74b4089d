use crate::error::{EidolonError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub jwt: JwtSettings,
    pub vpn: VpnConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Public hostname clients connect to, written into generated client configs
    pub public_host: String,
    /// Public port of the VPN endpoint
    #[serde(default = "default_public_port")]
    pub public_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// Seconds to wait for in-flight requests on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwtSettings {
    pub secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub expiry_minutes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VpnConfig {
    pub listen_ip: String,
    pub listen_port: u16,
    pub cert_directory: String,
    pub ca_common_name: String,
    pub server_common_name: String,
    pub organization: String,
    pub country: String,
    #[serde(default = "default_ocserv_binary")]
    pub ocserv_binary: String,
    #[serde(default = "default_occtl_binary")]
    pub occtl_binary: String,
    #[serde(default)]
    pub default_routes: Vec<String>,
    #[serde(default)]
    pub default_asn_routes: Vec<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelegramConfig {
    /// Bot token; the bot is disabled when empty
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_telegram_api")]
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// Enforcement loop period
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// System metrics refresh period
    #[serde(default = "default_poll_interval")]
    pub metrics_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    /// One of "pretty", "json" or "compact"
    pub format: String,
}

fn default_public_port() -> u16 {
    443
}

fn default_max_connections() -> u32 {
    5
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_jwt_expiry() -> u64 {
    24 * 60
}

fn default_ocserv_binary() -> String {
    "ocserv".to_string()
}

fn default_occtl_binary() -> String {
    "occtl".to_string()
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            metrics_interval_seconds: default_poll_interval(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EidolonError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| EidolonError::Config(e.to_string()))
    }

    /// Apply `EIDOLON_*` environment overrides for secrets and the database URL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("EIDOLON_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(secret) = std::env::var("EIDOLON_JWT_SECRET") {
            self.jwt.secret = secret;
        }
        if let Ok(token) = std::env::var("EIDOLON_TELEGRAM_TOKEN") {
            self.telegram.token = token;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt.secret.trim().is_empty() {
            return Err(EidolonError::Config("jwt.secret must not be empty".to_string()));
        }

        if self.traffic.poll_interval_seconds == 0 || self.traffic.metrics_interval_seconds == 0 {
            return Err(EidolonError::Config(
                "traffic intervals must be positive".to_string(),
            ));
        }

        for route in &self.vpn.default_routes {
            crate::routing::normalize_cidr(route).map_err(|e| {
                EidolonError::Config(format!("Invalid default route '{}': {}", route, e))
            })?;
        }

        Ok(())
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                public_host: "vpn.example.com".to_string(),
                public_port: default_public_port(),
            },
            database: DatabaseConfig {
                url: "sqlite://eidolon.db?mode=rwc".to_string(),
                max_connections: default_max_connections(),
            },
            api: ApiConfig {
                listen_addr: "0.0.0.0:8080".to_string(),
                shutdown_timeout_seconds: default_shutdown_timeout(),
            },
            jwt: JwtSettings {
                secret: "change-me-in-production".to_string(),
                expiry_minutes: default_jwt_expiry(),
            },
            vpn: VpnConfig {
                listen_ip: "0.0.0.0".to_string(),
                listen_port: 443,
                cert_directory: "/var/lib/eidolon/certs".to_string(),
                ca_common_name: "Eidolon VPN CA".to_string(),
                server_common_name: "vpn.example.com".to_string(),
                organization: "Eidolon VPN".to_string(),
                country: "RU".to_string(),
                ocserv_binary: default_ocserv_binary(),
                occtl_binary: default_occtl_binary(),
                default_routes: Vec::new(),
                default_asn_routes: Vec::new(),
            },
            telegram: TelegramConfig {
                token: String::new(),
                admin_ids: Vec::new(),
                api_url: default_telegram_api(),
            },
            traffic: TrafficConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.traffic.poll_interval_seconds, 300);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
public_host = "vpn.test"

[database]
url = "sqlite::memory:"

[api]
listen_addr = "127.0.0.1:9000"

[jwt]
secret = "s3cret"

[vpn]
listen_ip = "0.0.0.0"
listen_port = 4443
cert_directory = "/tmp/certs"
ca_common_name = "CA"
server_common_name = "vpn.test"
organization = "Test"
country = "NL"
default_routes = ["10.0.0.0/8"]

[logging]
level = "debug"
format = "json"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.public_port, 443);
        assert_eq!(config.vpn.occtl_binary, "occtl");
        assert_eq!(config.jwt.expiry_minutes, 24 * 60);
        assert!(config.telegram.token.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_default_route_rejected() {
        let mut config = Config::default();
        config.vpn.default_routes = vec!["not-a-network".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut config = Config::default();
        config.jwt.secret = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
