//! Chat command handling, independent of the messaging transport

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{EidolonError, Result};
use crate::models::{format_bytes, parse_bytes, period_range, total_bytes, Role, User};
use crate::routing::RouteService;
use crate::service::{AuthService, InviteService, VpnService};
use crate::traffic::SystemMonitor;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Who sent a message
#[derive(Debug, Clone)]
pub struct Sender {
    pub telegram_id: i64,
    pub username: String,
}

/// A parsed `/command args` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub name: String,
    pub args: &'a str,
}

impl<'a> Command<'a> {
    /// `None` unless the text starts with `/`. A `@botname` suffix is ignored.
    pub fn parse(text: &'a str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;

        let (head, args) = match rest.find(char::is_whitespace) {
            Some(i) => (&rest[..i], rest[i..].trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        if name.is_empty() {
            return None;
        }
        Some(Self { name, args })
    }
}

pub struct BotHandler {
    auth: Arc<AuthService>,
    invites: Arc<InviteService>,
    routes: Arc<RouteService>,
    vpn: Arc<VpnService>,
    monitor: Arc<SystemMonitor>,
}

impl BotHandler {
    pub fn new(
        auth: Arc<AuthService>,
        invites: Arc<InviteService>,
        routes: Arc<RouteService>,
        vpn: Arc<VpnService>,
        monitor: Arc<SystemMonitor>,
    ) -> Self {
        Self {
            auth,
            invites,
            routes,
            vpn,
            monitor,
        }
    }

    /// Reply to one message. Unknown senders are registered first.
    pub async fn handle(&self, sender: &Sender, text: &str) -> String {
        let (user, created) = match self
            .auth
            .register_with_telegram(sender.telegram_id, &sender.username)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to resolve telegram user {}: {}", sender.telegram_id, e);
                return "Authentication error. Please try again later.".to_string();
            }
        };

        let command = Command::parse(text);

        if created {
            let welcome = welcome_text(&user);
            return match command {
                Some(cmd) if cmd.name != "start" && cmd.name != "help" => {
                    format!("{}\n\n{}", welcome, self.dispatch(&user, &cmd).await)
                }
                _ => welcome,
            };
        }

        match command {
            Some(cmd) => self.dispatch(&user, &cmd).await,
            None => help_text(&user),
        }
    }

    async fn dispatch(&self, user: &User, cmd: &Command<'_>) -> String {
        let result = match cmd.name.as_str() {
            "start" => Ok("Welcome to Eidolon VPN!\nSend /help for the list of commands.".to_string()),
            "help" => Ok(help_text(user)),
            "status" => self.status(user).await,
            "invite" => self.redeem_invite(user, cmd.args).await,
            "generate" => self.generate_invite(user).await,
            "myinvites" => self.my_invites(user).await,
            "routes" => self.list_routes(user).await,
            "addroute" => self.add_route(user, cmd.args).await,
            "traffic" => self.traffic(user, cmd.args).await,
            "config" => self.vpn.client_config(user),
            "disconnect" => self.disconnect(user, cmd.args).await,
            "users" => self.users(user).await,
            "setrole" => self.set_role(user, cmd.args).await,
            "setlimit" => self.set_limit(user, cmd.args).await,
            _ => Ok("Unknown command. Send /help for the list of commands.".to_string()),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                info!("/{} from {} failed: {}", cmd.name, user.username, e);
                error_reply(&e)
            }
        }
    }

    async fn status(&self, user: &User) -> Result<String> {
        let connections = self.vpn.active_connections().await;
        let mut msg = String::from("VPN status:\n\n");

        let _ = writeln!(msg, "Daemon: {}", self.vpn.daemon_state().await);
        let _ = writeln!(msg, "Active connections: {}", connections.len());

        if user.is_admin() && !connections.is_empty() {
            msg.push_str("\nConnected users:\n");
            let sorted: BTreeMap<_, _> = connections.into_iter().collect();
            for (id, session) in sorted {
                let _ = writeln!(msg, "- {} (ID: {})", session, id);
            }
        }

        let _ = write!(
            msg,
            "\nYour account:\nUsername: {}\nRole: {}\n",
            user.username, user.role
        );

        let used = self.vpn.total_user_traffic(user.id).await?;
        let _ = write!(msg, "Traffic used: {}", format_bytes(used));
        if user.has_traffic_limit() {
            let _ = write!(msg, " of {}", format_bytes(user.traffic_limit));
        }
        msg.push('\n');

        if user.is_admin() {
            let _ = write!(msg, "\n{}", self.monitor.status_text().await);
        }

        Ok(msg)
    }

    async fn redeem_invite(&self, user: &User, code: &str) -> Result<String> {
        if code.is_empty() {
            return Ok("Give the invite code. Example: /invite ABC123XYZ".to_string());
        }

        let user = self.invites.use_invite(code, user.clone()).await?;

        if let Err(e) = self.vpn.create_user_certificate(user.id).await {
            error!("Failed to issue certificate for {}: {}", user.username, e);
            return Ok("Invite accepted, but the certificate could not be issued. Contact an administrator.".to_string());
        }

        Ok(format!(
            "Invite accepted!\nYour role: {}\n\nSend /config to get your VPN profile.",
            user.role
        ))
    }

    async fn generate_invite(&self, user: &User) -> Result<String> {
        let invite = self.invites.generate(user.id).await?;
        Ok(format!(
            "Invite code generated!\n\nCode: {}\nValid until: {}",
            invite.code,
            invite.expires_at.format(DATE_FORMAT)
        ))
    }

    async fn my_invites(&self, user: &User) -> Result<String> {
        if !user.limits().can_manage_invites {
            return Err(EidolonError::denied("invite management"));
        }

        let invites = self.invites.list(user.id).await?;
        if invites.is_empty() {
            return Ok("You have no invite codes yet. Send /generate to create one.".to_string());
        }

        let now = Utc::now();
        let mut active = Vec::new();
        let mut used = Vec::new();
        let mut expired = Vec::new();

        for invite in &invites {
            if let Some(at) = invite.used_at.filter(|_| invite.used_by.is_some()) {
                used.push((invite.code.as_str(), at));
            } else if invite.is_valid_at(now) {
                active.push((invite.code.as_str(), invite.expires_at));
            } else {
                expired.push((invite.code.as_str(), invite.expires_at));
            }
        }

        let mut msg = String::from("Your invite codes:\n");
        section(&mut msg, "Active", "expires", &active);
        section(&mut msg, "Used", "used", &used);
        section(&mut msg, "Expired", "expired", &expired);
        Ok(msg)
    }

    async fn list_routes(&self, user: &User) -> Result<String> {
        if !user.limits().can_add_routes {
            return Err(EidolonError::denied("route management"));
        }

        let routes = self.routes.resolve(user.id).await?;
        if routes.is_empty() {
            return Ok("You have no routes yet.\nSend /addroute <CIDR> to add one.".to_string());
        }

        let mut msg = String::from("Your routes:\n\n");
        for (i, route) in routes.iter().enumerate() {
            let _ = writeln!(msg, "{}. {} [{}]", i + 1, route.network, route.route_type);
            if !route.description.is_empty() {
                let _ = writeln!(msg, "   {}", route.description);
            }
        }
        Ok(msg)
    }

    async fn add_route(&self, user: &User, network: &str) -> Result<String> {
        if network.is_empty() {
            return Ok("Give a network in CIDR form. Example: /addroute 192.168.0.0/24".to_string());
        }

        let route = self
            .routes
            .create_and_assign_route(user, network, "Added via Telegram")
            .await?;
        Ok(format!("Route {} added!", route.network))
    }

    async fn traffic(&self, user: &User, period: &str) -> Result<String> {
        let period = if period.is_empty() { "month" } else { period };
        let (from, to) = period_range(period);

        let samples = self
            .vpn
            .user_traffic(user.id, from.timestamp(), to.timestamp())
            .await?;

        if samples.is_empty() {
            return Ok("No traffic recorded yet.".to_string());
        }

        let mut msg = format!(
            "Traffic since {}: {}\n\n",
            from.format("%Y-%m-%d"),
            format_bytes(total_bytes(&samples))
        );

        let mut daily: BTreeMap<String, i64> = BTreeMap::new();
        for sample in &samples {
            *daily
                .entry(sample.timestamp.format("%Y-%m-%d").to_string())
                .or_default() += sample.bytes;
        }

        for (day, bytes) in daily.iter().rev().take(7) {
            let _ = writeln!(msg, "{}: {}", day, format_bytes(*bytes));
        }
        Ok(msg)
    }

    async fn disconnect(&self, user: &User, username: &str) -> Result<String> {
        require_admin(user)?;
        if username.is_empty() {
            return Ok("Give the username. Example: /disconnect alice".to_string());
        }

        let target = self.auth.get_user_by_username(username).await?;
        self.vpn.disconnect_user(target.id).await?;
        Ok(format!("{} disconnected.", target.username))
    }

    async fn users(&self, user: &User) -> Result<String> {
        require_admin(user)?;

        let users = self.auth.list_users(0, 100).await?;
        if users.is_empty() {
            return Ok("No users.".to_string());
        }

        let mut msg = String::from("Users:\n\n");
        for (i, u) in users.iter().enumerate() {
            let last = u
                .last_login_at
                .map(|t| t.format(DATE_FORMAT).to_string())
                .unwrap_or_else(|| "never".to_string());
            let _ = writeln!(
                msg,
                "{}. {} (ID: {})\n   Role: {}\n   Last login: {}",
                i + 1,
                u.username,
                u.id,
                u.role,
                last
            );
        }
        Ok(msg)
    }

    async fn set_role(&self, user: &User, args: &str) -> Result<String> {
        require_admin(user)?;

        let mut parts = args.split_whitespace();
        let (Some(username), Some(role)) = (parts.next(), parts.next()) else {
            return Ok("Usage: /setrole <username> <admin|user|vassal>".to_string());
        };
        let role = Role::parse(role)
            .ok_or_else(|| EidolonError::invalid(format!("unknown role {}", role)))?;

        let target = self.auth.get_user_by_username(username).await?;
        let updated = self.auth.set_role(user, target.id, role).await?;
        Ok(format!("{} is now {}.", updated.username, updated.role))
    }

    async fn set_limit(&self, user: &User, args: &str) -> Result<String> {
        require_admin(user)?;

        let mut parts = args.splitn(2, char::is_whitespace);
        let (Some(username), Some(amount)) = (parts.next(), parts.next()) else {
            return Ok("Usage: /setlimit <username> <bytes, e.g. 50GB or 0 for unlimited>".to_string());
        };
        let limit = parse_bytes(amount)
            .ok_or_else(|| EidolonError::invalid(format!("cannot read {:?} as a size", amount.trim())))?;

        let target = self.auth.get_user_by_username(username).await?;
        let updated = self.auth.set_traffic_limit(user, target.id, limit).await?;

        if updated.has_traffic_limit() {
            Ok(format!(
                "Traffic limit of {} set to {}.",
                updated.username,
                format_bytes(updated.traffic_limit)
            ))
        } else {
            Ok(format!("Traffic limit of {} removed.", updated.username))
        }
    }
}

fn require_admin(user: &User) -> Result<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(EidolonError::denied("administrator command"))
    }
}

fn section(msg: &mut String, title: &str, verb: &str, items: &[(&str, DateTime<Utc>)]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(msg, "\n{}:", title);
    for (i, (code, at)) in items.iter().enumerate() {
        let _ = writeln!(msg, "{}. {} ({} {})", i + 1, code, verb, at.format(DATE_FORMAT));
    }
}

fn welcome_text(user: &User) -> String {
    let mut msg = String::from("Welcome to Eidolon VPN!\n\n");
    if user.is_admin() {
        msg.push_str("You are registered as an administrator.\n");
    } else {
        msg.push_str("To use the VPN you need an invite code.\nSend /invite <code> to activate it.\n");
    }
    msg.push_str("\nSend /help for the list of commands.");
    msg
}

/// Commands available to this user's role
pub fn help_text(user: &User) -> String {
    let limits = user.limits();
    let mut msg = String::from("Available commands:\n\n");

    msg.push_str("/status - VPN status\n");
    msg.push_str("/invite <code> - Activate an invite code\n");
    msg.push_str("/traffic [day|week|month|year] - Traffic statistics\n");
    msg.push_str("/config - Get your VPN profile\n");

    if limits.can_manage_invites {
        msg.push_str("/generate - Generate an invite code\n");
        msg.push_str("/myinvites - List your invite codes\n");
    }

    if limits.can_add_routes {
        msg.push_str("/routes - Show your routes\n");
        msg.push_str("/addroute <CIDR> - Add a route\n");
    }

    if user.is_admin() {
        msg.push_str("/users - List users\n");
        msg.push_str("/disconnect <username> - Disconnect a user\n");
        msg.push_str("/setrole <username> <role> - Change a user's role\n");
        msg.push_str("/setlimit <username> <size> - Set a traffic limit\n");
    }

    msg
}

fn error_reply(e: &EidolonError) -> String {
    match e {
        EidolonError::PermissionDenied(what) => format!("You are not allowed to do that ({}).", what),
        EidolonError::NotFound(what) => format!("Not found: {}", what),
        EidolonError::InvalidInput(what) => format!("Invalid input: {}", what),
        EidolonError::InvalidState(what) => what.clone(),
        _ => "Something went wrong. Please try again later.".to_string(),
    }
}
