//! SQLite implementation of the repositories

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use super::{InviteRepository, RouteRepository, TrafficRepository, UserRepository};
use crate::config::DatabaseConfig;
use crate::error::{EidolonError, Result};
use crate::models::{AsnRoute, InviteCode, Role, Route, RouteGroup, RouteType, User, UserTraffic};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        telegram_id INTEGER UNIQUE,
        role TEXT NOT NULL,
        certificate TEXT,
        created_at TEXT NOT NULL,
        last_login_at TEXT,
        invited_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
        traffic_limit INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invite_codes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        code TEXT NOT NULL UNIQUE,
        created_by INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        used_by INTEGER REFERENCES users(id) ON DELETE CASCADE,
        used_at TEXT,
        expired BOOLEAN NOT NULL DEFAULT 0,
        expires_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        network TEXT NOT NULL,
        type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_by INTEGER REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS asn_routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asn INTEGER NOT NULL,
        type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_by INTEGER REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS route_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_by INTEGER REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS route_group_items (
        group_id INTEGER NOT NULL REFERENCES route_groups(id) ON DELETE CASCADE,
        route_id INTEGER NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
        PRIMARY KEY (group_id, route_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_routes (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        route_id INTEGER NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
        enabled BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        PRIMARY KEY (user_id, route_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_route_groups (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        group_id INTEGER NOT NULL REFERENCES route_groups(id) ON DELETE CASCADE,
        enabled BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        PRIMARY KEY (user_id, group_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_traffic (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        bytes INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_users_invited_by ON users(invited_by)",
    "CREATE INDEX IF NOT EXISTS idx_invite_codes_creator ON invite_codes(created_by)",
    "CREATE INDEX IF NOT EXISTS idx_routes_type ON routes(type)",
    "CREATE INDEX IF NOT EXISTS idx_user_traffic_user_ts ON user_traffic(user_id, timestamp)",
];

const USER_COLUMNS: &str =
    "id, username, telegram_id, role, certificate, created_at, last_login_at, invited_by, traffic_limit";
const INVITE_COLUMNS: &str =
    "id, code, created_by, created_at, used_by, used_at, expired, expires_at";
const ROUTE_COLUMNS: &str = "id, network, type, description, created_by, created_at";

/// Relational store backed by a sqlx SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool; call [`SqliteStore::init_db`] before use
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Open the configured database and create the schema
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let db = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self::new(db);
        store.init_db().await?;
        info!("Database ready at {}", config.url);
        Ok(store)
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(db);
        store.init_db().await?;
        Ok(store)
    }

    /// Create all tables and indexes
    pub async fn init_db(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EidolonError::Parse(format!("Invalid timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_route_type(value: &str) -> Result<RouteType> {
    RouteType::from_db_string(value)
        .ok_or_else(|| EidolonError::Parse(format!("Invalid route type: {}", value)))
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        telegram_id: row.try_get("telegram_id")?,
        role: Role::from_db_string(&role),
        certificate: row.try_get("certificate")?,
        created_at: parse_ts(&created_at)?,
        last_login_at: parse_opt_ts(row.try_get("last_login_at")?)?,
        invited_by: row.try_get("invited_by")?,
        traffic_limit: row.try_get("traffic_limit")?,
    })
}

fn row_to_invite(row: &SqliteRow) -> Result<InviteCode> {
    let created_at: String = row.try_get("created_at")?;
    let expires_at: String = row.try_get("expires_at")?;

    Ok(InviteCode {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts(&created_at)?,
        used_by: row.try_get("used_by")?,
        used_at: parse_opt_ts(row.try_get("used_at")?)?,
        expired: row.try_get("expired")?,
        expires_at: parse_ts(&expires_at)?,
    })
}

fn row_to_route(row: &SqliteRow) -> Result<Route> {
    let route_type: String = row.try_get("type")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Route {
        id: row.try_get("id")?,
        network: row.try_get("network")?,
        route_type: parse_route_type(&route_type)?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_asn_route(row: &SqliteRow) -> Result<AsnRoute> {
    let route_type: String = row.try_get("type")?;
    let created_at: String = row.try_get("created_at")?;
    let asn: i64 = row.try_get("asn")?;

    Ok(AsnRoute {
        id: row.try_get("id")?,
        asn: u32::try_from(asn).map_err(|_| EidolonError::Parse(format!("Invalid ASN: {}", asn)))?,
        route_type: parse_route_type(&route_type)?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_group(row: &SqliteRow) -> Result<RouteGroup> {
    let created_at: String = row.try_get("created_at")?;

    Ok(RouteGroup {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_traffic(row: &SqliteRow) -> Result<UserTraffic> {
    let timestamp: i64 = row.try_get("timestamp")?;

    Ok(UserTraffic {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        bytes: row.try_get("bytes")?,
        timestamp: Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| EidolonError::Parse(format!("Invalid timestamp: {}", timestamp)))?,
    })
}

fn require_affected(rows: u64, what: String) -> Result<()> {
    if rows == 0 {
        return Err(EidolonError::NotFound(what));
    }
    Ok(())
}

#[async_trait]
impl UserRepository for SqliteStore {
    async fn create_user(&self, user: &User) -> Result<User> {
        let id = sqlx::query(
            r#"
            INSERT INTO users (
                username, telegram_id, role, certificate, created_at,
                last_login_at, invited_by, traffic_limit
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.username)
        .bind(user.telegram_id)
        .bind(user.role.to_db_string())
        .bind(&user.certificate)
        .bind(ts(&user.created_at))
        .bind(user.last_login_at.as_ref().map(ts))
        .bind(user.invited_by)
        .bind(user.traffic_limit)
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        Ok(User { id, ..user.clone() })
    }

    async fn get_user(&self, id: i64) -> Result<User> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| EidolonError::NotFound(format!("User {}", id)))?;

        row_to_user(&row)
    }

    async fn get_user_by_telegram_id(&self, telegram_id: i64) -> Result<User> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE telegram_id = ?",
            USER_COLUMNS
        ))
        .bind(telegram_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| EidolonError::NotFound(format!("User with telegram id {}", telegram_id)))?;

        row_to_user(&row)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE username = ?", USER_COLUMNS))
            .bind(username)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| EidolonError::NotFound(format!("User {}", username)))?;

        row_to_user(&row)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                username = ?, telegram_id = ?, role = ?, certificate = ?,
                last_login_at = ?, invited_by = ?, traffic_limit = ?
            WHERE id = ?
            "#,
        )
        .bind(&user.username)
        .bind(user.telegram_id)
        .bind(user.role.to_db_string())
        .bind(&user.certificate)
        .bind(user.last_login_at.as_ref().map(ts))
        .bind(user.invited_by)
        .bind(user.traffic_limit)
        .bind(user.id)
        .execute(&self.db)
        .await?;

        require_affected(result.rows_affected(), format!("User {}", user.id))
    }

    async fn delete_user(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        require_affected(result.rows_affected(), format!("User {}", id))
    }

    async fn list_users(&self, offset: i64, limit: i64) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users ORDER BY id LIMIT ? OFFSET ?",
            USER_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn count_users_invited_by(&self, inviter_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM users WHERE invited_by = ?")
            .bind(inviter_id)
            .fetch_one(&self.db)
            .await?;

        Ok(row.try_get("count")?)
    }

    async fn invited_users(&self, inviter_id: i64) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users WHERE invited_by = ? ORDER BY id",
            USER_COLUMNS
        ))
        .bind(inviter_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_user).collect()
    }
}

#[async_trait]
impl InviteRepository for SqliteStore {
    async fn create_invite(&self, invite: &InviteCode) -> Result<InviteCode> {
        let id = sqlx::query(
            r#"
            INSERT INTO invite_codes (
                code, created_by, created_at, used_by, used_at, expired, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&invite.code)
        .bind(invite.created_by)
        .bind(ts(&invite.created_at))
        .bind(invite.used_by)
        .bind(invite.used_at.as_ref().map(ts))
        .bind(invite.expired)
        .bind(ts(&invite.expires_at))
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        Ok(InviteCode { id, ..invite.clone() })
    }

    async fn get_invite_by_code(&self, code: &str) -> Result<InviteCode> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM invite_codes WHERE code = ?",
            INVITE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| EidolonError::NotFound(format!("Invite code {}", code)))?;

        row_to_invite(&row)
    }

    async fn get_invite(&self, id: i64) -> Result<InviteCode> {
        let row = sqlx::query(&format!("SELECT {} FROM invite_codes WHERE id = ?", INVITE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| EidolonError::NotFound(format!("Invite {}", id)))?;

        row_to_invite(&row)
    }

    async fn update_invite(&self, invite: &InviteCode) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE invite_codes SET
                used_by = ?, used_at = ?, expired = ?, expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(invite.used_by)
        .bind(invite.used_at.as_ref().map(ts))
        .bind(invite.expired)
        .bind(ts(&invite.expires_at))
        .bind(invite.id)
        .execute(&self.db)
        .await?;

        require_affected(result.rows_affected(), format!("Invite {}", invite.id))
    }

    async fn delete_invite(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM invite_codes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        require_affected(result.rows_affected(), format!("Invite {}", id))
    }

    async fn list_invites_by_creator(&self, creator_id: i64) -> Result<Vec<InviteCode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM invite_codes WHERE created_by = ? ORDER BY id",
            INVITE_COLUMNS
        ))
        .bind(creator_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_invite).collect()
    }

    async fn count_active_invites(&self, creator_id: i64) -> Result<u32> {
        // expires_at is RFC 3339 text, compare in Rust
        let invites = self.list_invites_by_creator(creator_id).await?;
        let now = Utc::now();
        Ok(invites.iter().filter(|i| i.is_valid_at(now)).count() as u32)
    }
}

#[async_trait]
impl RouteRepository for SqliteStore {
    async fn create_route(&self, route: &Route) -> Result<Route> {
        let id = sqlx::query(
            r#"
            INSERT INTO routes (network, type, description, created_by, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&route.network)
        .bind(route.route_type.to_db_string())
        .bind(&route.description)
        .bind(route.created_by)
        .bind(ts(&route.created_at))
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        Ok(Route { id, ..route.clone() })
    }

    async fn get_route(&self, id: i64) -> Result<Route> {
        let row = sqlx::query(&format!("SELECT {} FROM routes WHERE id = ?", ROUTE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| EidolonError::NotFound(format!("Route {}", id)))?;

        row_to_route(&row)
    }

    async fn update_route(&self, route: &Route) -> Result<()> {
        let result = sqlx::query(
            "UPDATE routes SET network = ?, type = ?, description = ? WHERE id = ?",
        )
        .bind(&route.network)
        .bind(route.route_type.to_db_string())
        .bind(&route.description)
        .bind(route.id)
        .execute(&self.db)
        .await?;

        require_affected(result.rows_affected(), format!("Route {}", route.id))
    }

    async fn delete_route(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM routes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        require_affected(result.rows_affected(), format!("Route {}", id))
    }

    async fn list_routes(&self, route_type: Option<RouteType>) -> Result<Vec<Route>> {
        let rows = match route_type {
            Some(t) => {
                sqlx::query(&format!(
                    "SELECT {} FROM routes WHERE type = ? ORDER BY id",
                    ROUTE_COLUMNS
                ))
                .bind(t.to_db_string())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {} FROM routes ORDER BY id", ROUTE_COLUMNS))
                    .fetch_all(&self.db)
                    .await?
            }
        };

        rows.iter().map(row_to_route).collect()
    }

    async fn create_asn_route(&self, route: &AsnRoute) -> Result<AsnRoute> {
        let id = sqlx::query(
            r#"
            INSERT INTO asn_routes (asn, type, description, created_by, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(i64::from(route.asn))
        .bind(route.route_type.to_db_string())
        .bind(&route.description)
        .bind(route.created_by)
        .bind(ts(&route.created_at))
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        Ok(AsnRoute { id, ..route.clone() })
    }

    async fn get_asn_route(&self, id: i64) -> Result<AsnRoute> {
        let row = sqlx::query(
            "SELECT id, asn, type, description, created_by, created_at FROM asn_routes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| EidolonError::NotFound(format!("ASN route {}", id)))?;

        row_to_asn_route(&row)
    }

    async fn list_asn_routes(&self, route_type: Option<RouteType>) -> Result<Vec<AsnRoute>> {
        let base = "SELECT id, asn, type, description, created_by, created_at FROM asn_routes";
        let rows = match route_type {
            Some(t) => {
                sqlx::query(&format!("{} WHERE type = ? ORDER BY id", base))
                    .bind(t.to_db_string())
                    .fetch_all(&self.db)
                    .await?
            }
            None => {
                sqlx::query(&format!("{} ORDER BY id", base))
                    .fetch_all(&self.db)
                    .await?
            }
        };

        rows.iter().map(row_to_asn_route).collect()
    }

    async fn delete_asn_route(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM asn_routes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        require_affected(result.rows_affected(), format!("ASN route {}", id))
    }

    async fn create_group(&self, group: &RouteGroup) -> Result<RouteGroup> {
        let id = sqlx::query(
            "INSERT INTO route_groups (name, description, created_by, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&group.name)
        .bind(&group.description)
        .bind(group.created_by)
        .bind(ts(&group.created_at))
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        Ok(RouteGroup { id, ..group.clone() })
    }

    async fn get_group(&self, id: i64) -> Result<RouteGroup> {
        let row = sqlx::query(
            "SELECT id, name, description, created_by, created_at FROM route_groups WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| EidolonError::NotFound(format!("Route group {}", id)))?;

        row_to_group(&row)
    }

    async fn list_groups(&self) -> Result<Vec<RouteGroup>> {
        let rows = sqlx::query(
            "SELECT id, name, description, created_by, created_at FROM route_groups ORDER BY id",
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_group).collect()
    }

    async fn delete_group(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM route_groups WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        require_affected(result.rows_affected(), format!("Route group {}", id))
    }

    async fn add_route_to_group(&self, group_id: i64, route_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO route_group_items (group_id, route_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(route_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn remove_route_from_group(&self, group_id: i64, route_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM route_group_items WHERE group_id = ? AND route_id = ?")
            .bind(group_id)
            .bind(route_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn routes_in_group(&self, group_id: i64) -> Result<Vec<Route>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.network, r.type, r.description, r.created_by, r.created_at
            FROM routes r
            JOIN route_group_items gi ON gi.route_id = r.id
            WHERE gi.group_id = ?
            ORDER BY gi.rowid
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_route).collect()
    }

    async fn assign_route_to_user(&self, user_id: i64, route_id: i64, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_routes (user_id, route_id, enabled, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id, route_id) DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(user_id)
        .bind(route_id)
        .bind(enabled)
        .bind(ts(&Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn unassign_route_from_user(&self, user_id: i64, route_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM user_routes WHERE user_id = ? AND route_id = ?")
            .bind(user_id)
            .bind(route_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn user_routes(&self, user_id: i64) -> Result<Vec<Route>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.network, r.type, r.description, r.created_by, r.created_at
            FROM routes r
            JOIN user_routes ur ON ur.route_id = r.id
            WHERE ur.user_id = ? AND ur.enabled = 1
            ORDER BY ur.rowid
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_route).collect()
    }

    async fn assign_group_to_user(&self, user_id: i64, group_id: i64, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_route_groups (user_id, group_id, enabled, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id, group_id) DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(user_id)
        .bind(group_id)
        .bind(enabled)
        .bind(ts(&Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn unassign_group_from_user(&self, user_id: i64, group_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM user_route_groups WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn user_groups(&self, user_id: i64) -> Result<Vec<RouteGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.name, g.description, g.created_by, g.created_at
            FROM route_groups g
            JOIN user_route_groups ug ON ug.group_id = g.id
            WHERE ug.user_id = ? AND ug.enabled = 1
            ORDER BY ug.rowid
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_group).collect()
    }
}

#[async_trait]
impl TrafficRepository for SqliteStore {
    async fn log_traffic(
        &self,
        user_id: i64,
        bytes: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<UserTraffic> {
        let id = sqlx::query("INSERT INTO user_traffic (user_id, bytes, timestamp) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(bytes)
            .bind(timestamp.timestamp())
            .execute(&self.db)
            .await?
            .last_insert_rowid();

        Ok(UserTraffic {
            id,
            user_id,
            bytes,
            timestamp,
        })
    }

    async fn user_traffic(&self, user_id: i64, from: i64, to: i64) -> Result<Vec<UserTraffic>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, bytes, timestamp FROM user_traffic
            WHERE user_id = ? AND timestamp BETWEEN ? AND ?
            ORDER BY timestamp, id
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_traffic).collect()
    }

    async fn total_user_traffic(&self, user_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(bytes), 0) AS total FROM user_traffic WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await?;

        Ok(row.try_get("total")?)
    }

    async fn total_traffic(&self, from: i64, to: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(bytes), 0) AS total FROM user_traffic WHERE timestamp BETWEEN ? AND ?",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.db)
        .await?;

        Ok(row.try_get("total")?)
    }

    async fn traffic_in_range(&self, from: i64, to: i64) -> Result<Vec<UserTraffic>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, bytes, timestamp FROM user_traffic
            WHERE timestamp BETWEEN ? AND ?
            ORDER BY timestamp, id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_traffic).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RouteType;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
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
    async fn test_user_crud() {
        let store = store().await;
        let mut user = User::new("alice", Role::User);
        user.telegram_id = Some(42);
        let user = store.create_user(&user).await.unwrap();
        assert!(user.id > 0);

        let by_tg = store.get_user_by_telegram_id(42).await.unwrap();
        assert_eq!(by_tg.username, "alice");

        let mut updated = by_tg.clone();
        updated.traffic_limit = 1000;
        updated.role = Role::Admin;
        store.update_user(&updated).await.unwrap();

        let fetched = store.get_user_by_username("alice").await.unwrap();
        assert_eq!(fetched.traffic_limit, 1000);
        assert_eq!(fetched.role, Role::Admin);

        store.delete_user(user.id).await.unwrap();
        assert!(matches!(
            store.get_user(user.id).await,
            Err(EidolonError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_role_string_maps_to_unknown() {
        let store = store().await;
        sqlx::query("INSERT INTO users (username, role, created_at) VALUES ('bob', 'overlord', ?)")
            .bind(Utc::now().to_rfc3339())
            .execute(store.pool())
            .await
            .unwrap();

        let bob = store.get_user_by_username("bob").await.unwrap();
        assert_eq!(bob.role, Role::Unknown);
    }

    #[tokio::test]
    async fn test_invited_by_nulls_on_inviter_delete() {
        let store = store().await;
        let inviter = store.create_user(&User::new("root", Role::Admin)).await.unwrap();
        let mut guest = User::new("guest", Role::User);
        guest.invited_by = Some(inviter.id);
        let guest = store.create_user(&guest).await.unwrap();

        assert_eq!(store.count_users_invited_by(inviter.id).await.unwrap(), 1);

        store.delete_user(inviter.id).await.unwrap();
        let guest = store.get_user(guest.id).await.unwrap();
        assert_eq!(guest.invited_by, None);
    }

    #[tokio::test]
    async fn test_route_assignment_upsert() {
        let store = store().await;
        let user = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        let r = store
            .create_route(&route("10.0.0.0/24", RouteType::Custom))
            .await
            .unwrap();

        store.assign_route_to_user(user.id, r.id, true).await.unwrap();
        store.assign_route_to_user(user.id, r.id, true).await.unwrap();
        assert_eq!(store.user_routes(user.id).await.unwrap().len(), 1);

        store.assign_route_to_user(user.id, r.id, false).await.unwrap();
        assert!(store.user_routes(user.id).await.unwrap().is_empty());

        store.assign_route_to_user(user.id, r.id, true).await.unwrap();
        store.unassign_route_from_user(user.id, r.id).await.unwrap();
        assert!(store.user_routes(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_membership() {
        let store = store().await;
        let a = store.create_route(&route("10.1.0.0/16", RouteType::Custom)).await.unwrap();
        let b = store.create_route(&route("10.2.0.0/16", RouteType::Custom)).await.unwrap();
        let group = store
            .create_group(&RouteGroup {
                id: 0,
                name: "office".to_string(),
                description: String::new(),
                created_by: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.add_route_to_group(group.id, a.id).await.unwrap();
        store.add_route_to_group(group.id, b.id).await.unwrap();
        store.add_route_to_group(group.id, a.id).await.unwrap();

        let routes = store.routes_in_group(group.id).await.unwrap();
        assert_eq!(routes, vec![a.clone(), b]);

        store.remove_route_from_group(group.id, a.id).await.unwrap();
        assert_eq!(store.routes_in_group(group.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_routes_by_type() {
        let store = store().await;
        store.create_route(&route("10.0.0.0/8", RouteType::Default)).await.unwrap();
        store.create_route(&route("192.168.0.0/16", RouteType::Blocked)).await.unwrap();

        assert_eq!(store.list_routes(None).await.unwrap().len(), 2);
        let defaults = store.list_routes(Some(RouteType::Default)).await.unwrap();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].network, "10.0.0.0/8");
    }

    #[tokio::test]
    async fn test_traffic_range_is_inclusive() {
        let store = store().await;
        let user = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(1_700_000_300, 0).unwrap();

        store.log_traffic(user.id, 100, t0).await.unwrap();
        store.log_traffic(user.id, 200, t1).await.unwrap();

        let samples = store
            .user_traffic(user.id, t0.timestamp(), t1.timestamp())
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);

        let samples = store
            .user_traffic(user.id, t0.timestamp() + 1, t1.timestamp())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);

        assert_eq!(store.total_user_traffic(user.id).await.unwrap(), 300);
        assert_eq!(
            store.total_traffic(t0.timestamp(), t0.timestamp()).await.unwrap(),
            100
        );
    }

    #[tokio::test]
    async fn test_total_traffic_without_samples_is_zero() {
        let store = store().await;
        assert_eq!(store.total_user_traffic(99).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_active_invite_count() {
        let store = store().await;
        let user = store.create_user(&User::new("alice", Role::User)).await.unwrap();
        let invite = store
            .create_invite(&InviteCode::new("aaaaaaaaaaaaaaaa".to_string(), user.id))
            .await
            .unwrap();
        store
            .create_invite(&InviteCode::new("bbbbbbbbbbbbbbbb".to_string(), user.id))
            .await
            .unwrap();
        assert_eq!(store.count_active_invites(user.id).await.unwrap(), 2);

        let mut used = store.get_invite_by_code(&invite.code).await.unwrap();
        used.consume(user.id);
        store.update_invite(&used).await.unwrap();
        assert_eq!(store.count_active_invites(user.id).await.unwrap(), 1);
    }
}
