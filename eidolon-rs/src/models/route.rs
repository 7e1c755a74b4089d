//! Routes, ASN routes, route groups and their user assignments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Route classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// Given to vassals with no individual routes
    Default,
    Custom,
    Asn,
    /// Excluded from the tunnel
    Blocked,
}

impl RouteType {
    /// Convert to database string
    pub fn to_db_string(&self) -> &'static str {
        match self {
            RouteType::Default => "default",
            RouteType::Custom => "custom",
            RouteType::Asn => "asn",
            RouteType::Blocked => "blocked",
        }
    }

    /// Parse from database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Some(RouteType::Default),
            "custom" => Some(RouteType::Custom),
            "asn" => Some(RouteType::Asn),
            "blocked" | "block" => Some(RouteType::Blocked),
            _ => None,
        }
    }

    /// Routes of this type are pushed to the daemon's allow list
    pub fn is_allowed(&self) -> bool {
        matches!(self, RouteType::Default | RouteType::Custom)
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// A network route in canonical CIDR form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    pub network: String,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub description: String,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A route expressed as an autonomous system number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsnRoute {
    pub id: i64,
    pub asn: u32,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub description: String,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteGroup {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Route assigned to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRoute {
    pub user_id: i64,
    pub route_id: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Route group assigned to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRouteGroup {
    pub user_id: i64,
    pub group_id: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_type_parsing() {
        assert_eq!(RouteType::from_db_string("custom"), Some(RouteType::Custom));
        assert_eq!(RouteType::from_db_string("Blocked"), Some(RouteType::Blocked));
        assert_eq!(RouteType::from_db_string("tunnel"), None);
    }

    #[test]
    fn test_allow_list_types() {
        assert!(RouteType::Default.is_allowed());
        assert!(RouteType::Custom.is_allowed());
        assert!(!RouteType::Blocked.is_allowed());
        assert!(!RouteType::Asn.is_allowed());
    }
}
