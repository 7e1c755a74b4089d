//! Invite codes

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Length of a generated invite code
pub const INVITE_CODE_LENGTH: usize = 16;

/// Days an invite stays valid
pub const INVITE_VALIDITY_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteCode {
    pub id: i64,
    pub code: String,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub used_by: Option<i64>,
    pub used_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub expires_at: DateTime<Utc>,
}

impl InviteCode {
    /// Build an unsaved invite issued now
    pub fn new(code: String, created_by: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            code,
            created_by,
            created_at: now,
            used_by: None,
            used_at: None,
            expired: false,
            expires_at: now + Duration::days(INVITE_VALIDITY_DAYS),
        }
    }

    /// Valid iff not expired, not used and not past its expiry
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.expired && self.used_by.is_none() && now < self.expires_at
    }

    /// Mark as consumed by `user_id`
    pub fn consume(&mut self, user_id: i64) {
        self.used_by = Some(user_id);
        self.used_at = Some(Utc::now());
        self.expired = true;
    }
}
