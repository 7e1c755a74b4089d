use anyhow::Context;
use clap::Parser;
use eidolon_rs::api::{ApiServer, AppState};
use eidolon_rs::bot::{BotHandler, TelegramBot};
use eidolon_rs::cert::{CertificateManager, CertificateOptions};
use eidolon_rs::config::Config;
use eidolon_rs::daemon::{OcctlIntrospector, OcservDaemon, OcservSettings, VpnDaemon};
use eidolon_rs::logging::init_logging;
use eidolon_rs::routing::RouteService;
use eidolon_rs::service::{AuthService, InviteService, JwtConfig, VpnService, VpnSettings};
use eidolon_rs::store::{SqliteStore, Store};
use eidolon_rs::traffic::SystemMonitor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "eidolon")]
#[command(about = "OpenConnect VPN control plane", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let (mut config, from_file) = if cli.config.exists() {
        let config = Config::from_file(&cli.config)
            .with_context(|| format!("reading {}", cli.config.display()))?;
        (config, true)
    } else {
        (Config::default(), false)
    };
    config.apply_env_overrides();
    config.validate()?;

    init_logging(&config.logging)?;

    info!("Starting eidolon");
    if !from_file {
        info!("No config file at {}, using defaults", cli.config.display());
    }
    info!("  API listening on: {}", config.api.listen_addr);
    info!("  VPN listening on: {}:{}", config.vpn.listen_ip, config.vpn.listen_port);
    info!("  Database: {}", config.database.url);

    // Storage
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&config.database).await?);

    // Certificates
    let certs = Arc::new(CertificateManager::load_or_create(
        &config.vpn.cert_directory,
        CertificateOptions {
            ca_common_name: config.vpn.ca_common_name.clone(),
            server_common_name: config.vpn.server_common_name.clone(),
            organization: config.vpn.organization.clone(),
            country: config.vpn.country.clone(),
        },
    )?);

    // Daemon
    let daemon: Arc<dyn VpnDaemon> = Arc::new(OcservDaemon::new(
        OcservSettings {
            binary: config.vpn.ocserv_binary.clone(),
            listen_ip: config.vpn.listen_ip.clone(),
            port: config.vpn.listen_port,
            cert_path: certs.server_cert_path(),
            key_path: certs.server_key_path(),
            ca_path: Some(certs.ca_cert_path()),
        },
        Arc::new(OcctlIntrospector::new(config.vpn.occtl_binary.clone())),
    ));

    let shutdown = CancellationToken::new();

    // Services
    let routes = Arc::new(RouteService::new(Arc::clone(&store), Arc::clone(&daemon)));
    let auth = Arc::new(AuthService::new(
        Arc::clone(&store),
        JwtConfig::new(config.jwt.secret.clone(), config.jwt.expiry_minutes),
        config.telegram.admin_ids.clone(),
    ));
    let invites = Arc::new(InviteService::new(Arc::clone(&store)));
    let vpn = Arc::new(VpnService::new(
        Arc::clone(&store),
        Arc::clone(&daemon),
        Arc::clone(&certs),
        VpnSettings {
            default_routes: config.vpn.default_routes.clone(),
            default_asn_routes: config.vpn.default_asn_routes.clone(),
            public_host: config.server.public_host.clone(),
            public_port: config.server.public_port,
            poll_interval: Duration::from_secs(config.traffic.poll_interval_seconds),
        },
        shutdown.clone(),
    ));

    vpn.start().await.context("starting the VPN daemon")?;

    let monitor = Arc::new(SystemMonitor::new(
        Arc::clone(&store),
        vpn.connections(),
        Duration::from_secs(config.traffic.metrics_interval_seconds),
    ));
    let monitor_handle = tokio::spawn(Arc::clone(&monitor).run(shutdown.clone()));

    // API server
    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        auth: Arc::clone(&auth),
        invites: Arc::clone(&invites),
        routes: Arc::clone(&routes),
        vpn: Arc::clone(&vpn),
        monitor: Arc::clone(&monitor),
    });
    let api = ApiServer::new(state, config.api.listen_addr.clone());
    let api_shutdown = shutdown.clone();
    let mut api_handle = tokio::spawn(async move { api.run(api_shutdown).await });

    // Telegram bot
    let bot_handle = if config.telegram.token.is_empty() {
        info!("No Telegram token configured, bot disabled");
        None
    } else {
        let handler = Arc::new(BotHandler::new(
            Arc::clone(&auth),
            Arc::clone(&invites),
            Arc::clone(&routes),
            Arc::clone(&vpn),
            Arc::clone(&monitor),
        ));
        let bot = Arc::new(TelegramBot::new(
            &config.telegram.api_url,
            &config.telegram.token,
            handler,
        )?);
        Some(tokio::spawn(bot.run(shutdown.clone())))
    };

    // Wait for a signal or for the API server to fail
    let mut sigterm = signal(SignalKind::terminate())?;
    let api_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
            false
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            false
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => error!("API server error: {}", e),
                Err(e) => error!("API task panic: {}", e),
            }
            true
        }
    };

    info!("Shutting down");
    shutdown.cancel();

    if let Err(e) = vpn.stop().await {
        error!("Failed to stop the VPN daemon: {}", e);
    }

    let grace = Duration::from_secs(config.api.shutdown_timeout_seconds);
    if !api_exited && tokio::time::timeout(grace, api_handle).await.is_err() {
        warn!("API server did not stop within {:?}", grace);
    }
    if let Some(handle) = bot_handle {
        let _ = tokio::time::timeout(grace, handle).await;
    }
    let _ = monitor_handle.await;

    info!("eidolon stopped");
    Ok(())
}
