//! Users and roles

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::policy::RoleLimits;

/// User role, ordered by privilege (admin > user > vassal > unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Vassal,
    /// Any stored role string we do not recognise; has no capabilities
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Vassal => "vassal",
            Role::Unknown => "unknown",
        }
    }

    /// Parse from database string; unrecognised values fail closed
    pub fn from_db_string(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "user" => Role::User,
            "vassal" => Role::Vassal,
            _ => Role::Unknown,
        }
    }

    /// Strict parse for user input: `unknown` is never accepted
    pub fn parse(s: &str) -> Option<Self> {
        match Self::from_db_string(s) {
            Role::Unknown => None,
            role => Some(role),
        }
    }

    /// Numeric privilege level
    pub fn privilege(&self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::User => 2,
            Role::Vassal => 1,
            Role::Unknown => 0,
        }
    }

    /// True if this role carries at least the privileges of `required`
    pub fn satisfies(&self, required: Role) -> bool {
        self.privilege() >= required.privilege()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// A VPN user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Session name on the daemon and certificate common name
    pub username: String,
    pub telegram_id: Option<i64>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub certificate: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub invited_by: Option<i64>,
    /// Byte quota; 0 means unlimited
    pub traffic_limit: i64,
}

impl User {
    /// Build an unsaved user; the store assigns the id
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            id: 0,
            username: username.into(),
            telegram_id: None,
            role,
            certificate: None,
            created_at: Utc::now(),
            last_login_at: None,
            invited_by: None,
            traffic_limit: 0,
        }
    }

    pub fn limits(&self) -> RoleLimits {
        RoleLimits::for_role(self.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn has_traffic_limit(&self) -> bool {
        self.traffic_limit > 0
    }
}
