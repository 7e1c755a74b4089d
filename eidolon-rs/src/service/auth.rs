//! Token issuance and user authentication

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cert::serial_and_common_name;
use crate::error::{EidolonError, Result};
use crate::models::{Role, User};
use crate::store::Store;

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

/// JWT configuration
pub struct JwtConfig {
    secret: String,
    expiration_secs: u64,
}

impl JwtConfig {
    pub fn new(secret: String, expiry_minutes: u64) -> Self {
        Self {
            secret,
            expiration_secs: expiry_minutes * 60,
        }
    }

    /// Create a new JWT token for a user
    pub fn create_token(&self, user: &User) -> Result<String> {
        let now = Utc::now().timestamp().max(0) as u64;

        let claims = Claims {
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
            exp: now + self.expiration_secs,
            iat: now,
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    /// Validate a JWT token and extract claims
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;

        Ok(token_data.claims)
    }
}

/// True if `actual` carries at least the privileges of `required`
pub fn has_role(actual: Role, required: Role) -> bool {
    required != Role::Unknown && actual.satisfies(required)
}

pub struct AuthService {
    store: Arc<dyn Store>,
    jwt: JwtConfig,
    admin_ids: Vec<i64>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, jwt: JwtConfig, admin_ids: Vec<i64>) -> Self {
        Self {
            store,
            jwt,
            admin_ids,
        }
    }

    pub fn jwt(&self) -> &JwtConfig {
        &self.jwt
    }

    pub fn generate_token(&self, user: &User) -> Result<String> {
        self.jwt.create_token(user)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        self.jwt.validate_token(token)
    }

    pub fn is_configured_admin(&self, telegram_id: i64) -> bool {
        self.admin_ids.contains(&telegram_id)
    }

    /// Find the user bound to `telegram_id`, registering one on first contact.
    /// Returns the user and whether it was just created.
    pub async fn register_with_telegram(
        &self,
        telegram_id: i64,
        username: &str,
    ) -> Result<(User, bool)> {
        match self.authenticate_with_telegram(telegram_id).await {
            Ok(user) => return Ok((user, false)),
            Err(EidolonError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let username = match username.trim() {
            "" => format!("tg{}", telegram_id),
            name => name.to_string(),
        };

        let role = if self.is_configured_admin(telegram_id) {
            Role::Admin
        } else {
            Role::Vassal
        };

        let mut user = User::new(username, role);
        user.telegram_id = Some(telegram_id);
        user.last_login_at = Some(Utc::now());

        let user = self.store.create_user(&user).await?;
        info!(
            "Registered {} (telegram {}) as {}",
            user.username, telegram_id, user.role
        );
        Ok((user, true))
    }

    pub async fn authenticate_with_telegram(&self, telegram_id: i64) -> Result<User> {
        let mut user = self.store.get_user_by_telegram_id(telegram_id).await?;
        user.last_login_at = Some(Utc::now());
        self.store.update_user(&user).await?;
        Ok(user)
    }

    /// Match a presented certificate against the one stored for its common name
    pub async fn authenticate_with_certificate(&self, pem: &str) -> Result<User> {
        let presented = serial_and_common_name(pem).map_err(|e| {
            warn!("Unreadable client certificate: {}", e);
            EidolonError::AuthenticationFailed
        })?;

        let mut user = match self.store.get_user_by_username(&presented.common_name).await {
            Ok(user) => user,
            Err(EidolonError::NotFound(_)) => return Err(EidolonError::AuthenticationFailed),
            Err(e) => return Err(e),
        };

        let stored = user
            .certificate
            .as_deref()
            .ok_or(EidolonError::AuthenticationFailed)
            .and_then(|pem| {
                serial_and_common_name(pem).map_err(|_| EidolonError::AuthenticationFailed)
            })?;

        if stored.serial != presented.serial {
            warn!(
                "Certificate serial mismatch for {} ({})",
                user.username,
                presented.serial_hex()
            );
            return Err(EidolonError::AuthenticationFailed);
        }

        user.last_login_at = Some(Utc::now());
        self.store.update_user(&user).await?;
        Ok(user)
    }

    pub async fn get_user(&self, id: i64) -> Result<User> {
        self.store.get_user(id).await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.store.get_user_by_username(username).await
    }

    pub async fn list_users(&self, offset: i64, limit: i64) -> Result<Vec<User>> {
        self.store.list_users(offset, limit).await
    }

    pub async fn set_role(&self, actor: &User, user_id: i64, role: Role) -> Result<User> {
        Self::require_admin(actor)?;
        if role == Role::Unknown {
            return Err(EidolonError::invalid("unknown role"));
        }

        let mut user = self.store.get_user(user_id).await?;
        user.role = role;
        self.store.update_user(&user).await?;
        info!("{} set role of {} to {}", actor.username, user.username, role);
        Ok(user)
    }

    /// Set the byte quota; 0 removes it
    pub async fn set_traffic_limit(&self, actor: &User, user_id: i64, limit: i64) -> Result<User> {
        Self::require_admin(actor)?;
        if limit < 0 {
            return Err(EidolonError::invalid("traffic limit must not be negative"));
        }

        let mut user = self.store.get_user(user_id).await?;
        user.traffic_limit = limit;
        self.store.update_user(&user).await?;
        info!(
            "{} set traffic limit of {} to {} bytes",
            actor.username, user.username, limit
        );
        Ok(user)
    }

    fn require_admin(actor: &User) -> Result<()> {
        if actor.limits().can_manage_users {
            Ok(())
        } else {
            Err(EidolonError::denied(format!(
                "{} may not manage users",
                actor.username
            )))
        }
    }
}
