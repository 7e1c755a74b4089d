//! Offline administration of the Eidolon database
//!
//! # Usage
//!
//! ```bash
//! eidolon-admin add-user alice --role user --limit 50GB
//! eidolon-admin set-role alice admin
//! eidolon-admin list-users
//! eidolon-admin add-route 10.0.0.0/8 --type default --description "office"
//! eidolon-admin list-routes --type blocked
//! eidolon-admin traffic alice --period week
//! eidolon-admin issue-cert alice --out alice.pem
//! ```
//!
//! Default and blocked routes added here reach the daemon on its next start.

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use eidolon_rs::cert::{CertificateManager, CertificateOptions};
use eidolon_rs::config::Config;
use eidolon_rs::models::{
    format_bytes, parse_bytes, period_range, total_bytes, Role, Route, RouteType, User,
};
use eidolon_rs::routing::normalize_cidr;
use eidolon_rs::store::{RouteRepository, SqliteStore, TrafficRepository, UserRepository};

#[derive(Parser)]
#[command(name = "eidolon-admin")]
#[command(about = "Manage Eidolon users and routes", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Database URL, overrides the configuration (e.g. sqlite://eidolon.db)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a user
    AddUser {
        username: String,
        /// admin, user or vassal
        #[arg(long, default_value = "user")]
        role: String,
        /// Traffic quota such as 50GB; 0 means unlimited
        #[arg(long, default_value = "0")]
        limit: String,
        #[arg(long)]
        telegram_id: Option<i64>,
    },
    /// Change a user's role
    SetRole { username: String, role: String },
    /// Change a user's traffic quota
    SetLimit { username: String, limit: String },
    /// List all users
    ListUsers,
    /// Add a route
    AddRoute {
        cidr: String,
        /// default, custom or blocked
        #[arg(long = "type", default_value = "custom")]
        route_type: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List routes, optionally of one type
    ListRoutes {
        #[arg(long = "type")]
        route_type: Option<String>,
    },
    /// Show a user's traffic
    Traffic {
        username: String,
        /// day, week, month or year
        #[arg(long, default_value = "month")]
        period: String,
    },
    /// Issue a client certificate and store it on the user
    IssueCert {
        username: String,
        /// Also write the PEM to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path).with_context(|| format!("reading {}", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

fn parse_role(s: &str) -> anyhow::Result<Role> {
    Role::parse(s).ok_or_else(|| anyhow!("unknown role {:?} (admin, user or vassal)", s))
}

fn parse_limit(s: &str) -> anyhow::Result<i64> {
    parse_bytes(s).ok_or_else(|| anyhow!("cannot read {:?} as a size", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(db) = cli.db {
        config.database.url = db;
    }

    let store = SqliteStore::connect(&config.database)
        .await
        .with_context(|| format!("opening {}", config.database.url))?;

    match cli.command {
        Commands::AddUser {
            username,
            role,
            limit,
            telegram_id,
        } => {
            let mut user = User::new(username.trim(), parse_role(&role)?);
            user.traffic_limit = parse_limit(&limit)?;
            user.telegram_id = telegram_id;

            let user = store.create_user(&user).await?;
            println!("✓ User {} added (ID {}, role {})", user.username, user.id, user.role);
        }
        Commands::SetRole { username, role } => {
            let mut user = store.get_user_by_username(&username).await?;
            user.role = parse_role(&role)?;
            store.update_user(&user).await?;
            println!("✓ {} is now {}", user.username, user.role);
        }
        Commands::SetLimit { username, limit } => {
            let mut user = store.get_user_by_username(&username).await?;
            user.traffic_limit = parse_limit(&limit)?;
            store.update_user(&user).await?;
            println!("✓ Traffic limit of {} set to {}", user.username, format_bytes(user.traffic_limit));
        }
        Commands::ListUsers => {
            let users = store.list_users(0, i64::MAX).await?;

            if users.is_empty() {
                println!("No users found.");
            } else {
                println!(
                    "{:<6} {:<24} {:<8} {:<12} {:<20}",
                    "ID", "Username", "Role", "Limit", "Last Login"
                );
                println!("{:-<74}", "");

                for user in &users {
                    let limit = if user.has_traffic_limit() {
                        format_bytes(user.traffic_limit)
                    } else {
                        "-".to_string()
                    };
                    let last_login = user
                        .last_login_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "Never".to_string());
                    println!(
                        "{:<6} {:<24} {:<8} {:<12} {:<20}",
                        user.id, user.username, user.role, limit, last_login
                    );
                }

                println!("\nTotal: {} user(s)", users.len());
            }
        }
        Commands::AddRoute {
            cidr,
            route_type,
            description,
        } => {
            let route_type = RouteType::from_db_string(&route_type)
                .ok_or_else(|| anyhow!("unknown route type {:?}", route_type))?;
            if route_type == RouteType::Asn {
                bail!("ASN routes are managed through the API");
            }

            let route = store
                .create_route(&Route {
                    id: 0,
                    network: normalize_cidr(&cidr)?,
                    route_type,
                    description,
                    created_by: None,
                    created_at: Utc::now(),
                })
                .await?;
            println!("✓ Route {} added ({}, ID {})", route.network, route.route_type, route.id);
        }
        Commands::ListRoutes { route_type } => {
            let filter = match route_type {
                Some(t) => Some(
                    RouteType::from_db_string(&t).ok_or_else(|| anyhow!("unknown route type {:?}", t))?,
                ),
                None => None,
            };

            let routes = store.list_routes(filter).await?;
            if routes.is_empty() {
                println!("No routes found.");
            } else {
                println!("{:<6} {:<20} {:<8} {}", "ID", "Network", "Type", "Description");
                println!("{:-<60}", "");
                for route in &routes {
                    println!(
                        "{:<6} {:<20} {:<8} {}",
                        route.id, route.network, route.route_type, route.description
                    );
                }
            }
        }
        Commands::Traffic { username, period } => {
            let user = store.get_user_by_username(&username).await?;
            let (from, to) = period_range(&period);
            let samples = store
                .user_traffic(user.id, from.timestamp(), to.timestamp())
                .await?;
            let all_time = store.total_user_traffic(user.id).await?;

            println!("Traffic of {} since {}", user.username, from.format("%Y-%m-%d"));
            println!("  Period:   {}", format_bytes(total_bytes(&samples)));
            println!("  All time: {}", format_bytes(all_time));
            if user.has_traffic_limit() {
                println!("  Limit:    {}", format_bytes(user.traffic_limit));
            }
        }
        Commands::IssueCert { username, out } => {
            let mut user = store.get_user_by_username(&username).await?;
            let certs = CertificateManager::load_or_create(
                &config.vpn.cert_directory,
                CertificateOptions {
                    ca_common_name: config.vpn.ca_common_name.clone(),
                    server_common_name: config.vpn.server_common_name.clone(),
                    organization: config.vpn.organization.clone(),
                    country: config.vpn.country.clone(),
                },
            )?;

            let pem = certs.create_client_certificate(&user.username)?;
            user.certificate = Some(pem.clone());
            store.update_user(&user).await?;

            if let Some(path) = out {
                std::fs::write(&path, &pem).with_context(|| format!("writing {}", path.display()))?;
                println!("✓ Certificate for {} written to {}", user.username, path.display());
            } else {
                println!("{}", pem);
            }
        }
    }

    store.close().await;
    Ok(())
}
