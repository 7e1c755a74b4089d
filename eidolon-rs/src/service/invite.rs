//! Invite codes: issuance, redemption and the invite tree

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::info;

use crate::error::{EidolonError, Result};
use crate::models::invite::INVITE_CODE_LENGTH;
use crate::models::{InviteCode, Role, User};
use crate::store::Store;

/// Inviter id → users it invited
pub type InviteTree = BTreeMap<i64, Vec<User>>;

/// Random URL-safe code of `INVITE_CODE_LENGTH` characters
pub fn generate_code() -> String {
    let mut bytes = vec![0u8; INVITE_CODE_LENGTH * 3 / 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut code = URL_SAFE_NO_PAD.encode(bytes);
    code.truncate(INVITE_CODE_LENGTH);
    code
}

pub struct InviteService {
    store: Arc<dyn Store>,
}

impl InviteService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Issue an invite, bounded by the creator's role limit on active invites
    pub async fn generate(&self, creator_id: i64) -> Result<InviteCode> {
        let creator = self.store.get_user(creator_id).await?;
        let limits = creator.limits();

        if limits.max_invites.is_zero() {
            return Err(EidolonError::denied(format!(
                "{} may not create invites",
                creator.username
            )));
        }

        let active = self.store.count_active_invites(creator_id).await?;
        if !limits.max_invites.allows(active) {
            return Err(EidolonError::denied("invite limit reached"));
        }

        let invite = self
            .store
            .create_invite(&InviteCode::new(generate_code(), creator_id))
            .await?;

        info!("{} generated invite {}", creator.username, invite.code);
        Ok(invite)
    }

    /// Redeem `code` for `candidate`.
    ///
    /// A candidate with id 0 is created; an existing one is upgraded in place.
    /// The new role is `user` when the inviter is an admin, `vassal` otherwise.
    pub async fn use_invite(&self, code: &str, mut candidate: User) -> Result<User> {
        let mut invite = self.store.get_invite_by_code(code.trim()).await.map_err(|e| match e {
            EidolonError::NotFound(_) => EidolonError::invalid("invalid invite code"),
            other => other,
        })?;

        if !invite.is_valid() {
            return Err(EidolonError::invalid("invite code is expired or already used"));
        }

        if candidate.id != 0 && (candidate.is_admin() || candidate.invited_by.is_some()) {
            return Err(EidolonError::InvalidState(format!(
                "{} is already activated",
                candidate.username
            )));
        }

        let inviter = self.store.get_user(invite.created_by).await?;
        if inviter.id == candidate.id {
            return Err(EidolonError::invalid("cannot redeem your own invite"));
        }

        candidate.role = if inviter.is_admin() {
            Role::User
        } else {
            Role::Vassal
        };
        candidate.invited_by = Some(inviter.id);

        let user = if candidate.id == 0 {
            candidate.created_at = Utc::now();
            self.store.create_user(&candidate).await?
        } else {
            self.store.update_user(&candidate).await?;
            candidate
        };

        invite.consume(user.id);
        self.store.update_invite(&invite).await?;

        info!(
            "{} joined as {} via invite from {}",
            user.username, user.role, inviter.username
        );
        Ok(user)
    }

    pub async fn list(&self, creator_id: i64) -> Result<Vec<InviteCode>> {
        self.store.list_invites_by_creator(creator_id).await
    }

    /// Delete an invite; only its creator or an admin may
    pub async fn delete(&self, invite_id: i64, actor_id: i64) -> Result<()> {
        let invite = self.store.get_invite(invite_id).await?;
        let actor = self.store.get_user(actor_id).await?;

        if invite.created_by != actor_id && !actor.is_admin() {
            return Err(EidolonError::denied("not the creator of this invite"));
        }

        self.store.delete_invite(invite_id).await
    }

    /// Users invited by `user_id`; admins get every level below them
    pub async fn tree(&self, user_id: i64) -> Result<InviteTree> {
        let user = self.store.get_user(user_id).await?;
        if !user.limits().can_view_invite_tree {
            return Err(EidolonError::denied(format!(
                "{} may not view the invite tree",
                user.username
            )));
        }

        let mut tree = InviteTree::new();
        let invited = self.store.invited_users(user_id).await?;

        if !user.is_admin() {
            tree.insert(user_id, invited);
            return Ok(tree);
        }

        let mut seen = HashSet::from([user_id]);
        let mut queue: VecDeque<i64> = invited.iter().map(|u| u.id).collect();
        tree.insert(user_id, invited);

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let children = self.store.invited_users(id).await?;
            queue.extend(children.iter().map(|u| u.id));
            tree.insert(id, children);
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InviteRepository, SqliteStore, UserRepository};
    use chrono::Duration;

    async fn setup() -> (Arc<SqliteStore>, InviteService) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let service = InviteService::new(store.clone());
        (store, service)
    }

    async fn user(store: &SqliteStore, name: &str, role: Role) -> User {
        store.create_user(&User::new(name, role)).await.unwrap()
    }

    #[test]
    fn test_generated_code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), INVITE_CODE_LENGTH);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(generate_code(), code);
    }

    #[tokio::test]
    async fn test_user_invite_limit() {
        let (store, service) = setup().await;
        let alice = user(&store, "alice", Role::User).await;

        for _ in 0..4 {
            service.generate(alice.id).await.unwrap();
        }
        let result = service.generate(alice.id).await;
        assert!(matches!(result, Err(EidolonError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_used_invites_free_a_slot() {
        let (store, service) = setup().await;
        let alice = user(&store, "alice", Role::User).await;

        let mut codes = Vec::new();
        for _ in 0..4 {
            codes.push(service.generate(alice.id).await.unwrap().code);
        }
        service
            .use_invite(&codes[0], User::new("bob", Role::Unknown))
            .await
            .unwrap();

        assert!(service.generate(alice.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_vassal_cannot_generate() {
        let (store, service) = setup().await;
        let vassal = user(&store, "vassal", Role::Vassal).await;
        assert!(matches!(
            service.generate(vassal.id).await,
            Err(EidolonError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_unlimited() {
        let (store, service) = setup().await;
        let admin = user(&store, "admin", Role::Admin).await;
        for _ in 0..10 {
            service.generate(admin.id).await.unwrap();
        }
        assert_eq!(store.count_active_invites(admin.id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_role_follows_inviter() {
        let (store, service) = setup().await;
        let admin = user(&store, "admin", Role::Admin).await;
        let alice = user(&store, "alice", Role::User).await;

        let from_admin = service.generate(admin.id).await.unwrap();
        let bob = service
            .use_invite(&from_admin.code, User::new("bob", Role::Unknown))
            .await
            .unwrap();
        assert_eq!(bob.role, Role::User);
        assert_eq!(bob.invited_by, Some(admin.id));

        let from_user = service.generate(alice.id).await.unwrap();
        let carol = service
            .use_invite(&from_user.code, User::new("carol", Role::Unknown))
            .await
            .unwrap();
        assert_eq!(carol.role, Role::Vassal);

        let used = store.get_invite(from_user.id).await.unwrap();
        assert_eq!(used.used_by, Some(carol.id));
        assert!(!used.is_valid());
    }

    #[tokio::test]
    async fn test_existing_user_upgraded_in_place() {
        let (store, service) = setup().await;
        let admin = user(&store, "admin", Role::Admin).await;
        let dave = user(&store, "dave", Role::Vassal).await;

        let invite = service.generate(admin.id).await.unwrap();
        let upgraded = service.use_invite(&invite.code, dave.clone()).await.unwrap();

        assert_eq!(upgraded.id, dave.id);
        assert_eq!(store.get_user(dave.id).await.unwrap().role, Role::User);

        let second = service.generate(admin.id).await.unwrap();
        let result = service.use_invite(&second.code, upgraded).await;
        assert!(matches!(result, Err(EidolonError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_invite_single_use_and_expiry() {
        let (store, service) = setup().await;
        let admin = user(&store, "admin", Role::Admin).await;

        let invite = service.generate(admin.id).await.unwrap();
        service
            .use_invite(&invite.code, User::new("eve", Role::Unknown))
            .await
            .unwrap();
        let again = service
            .use_invite(&invite.code, User::new("frank", Role::Unknown))
            .await;
        assert!(matches!(again, Err(EidolonError::InvalidInput(_))));

        let mut stale = service.generate(admin.id).await.unwrap();
        stale.expires_at = Utc::now() - Duration::hours(1);
        store.update_invite(&stale).await.unwrap();
        let expired = service
            .use_invite(&stale.code, User::new("gus", Role::Unknown))
            .await;
        assert!(matches!(expired, Err(EidolonError::InvalidInput(_))));

        let unknown = service
            .use_invite("nope", User::new("hal", Role::Unknown))
            .await;
        assert!(matches!(unknown, Err(EidolonError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_permissions() {
        let (store, service) = setup().await;
        let admin = user(&store, "admin", Role::Admin).await;
        let alice = user(&store, "alice", Role::User).await;
        let bob = user(&store, "bob", Role::User).await;

        let invite = service.generate(alice.id).await.unwrap();
        assert!(matches!(
            service.delete(invite.id, bob.id).await,
            Err(EidolonError::PermissionDenied(_))
        ));
        service.delete(invite.id, admin.id).await.unwrap();

        let own = service.generate(alice.id).await.unwrap();
        service.delete(own.id, alice.id).await.unwrap();
        assert!(service.list(alice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tree_depth_by_role() {
        let (store, service) = setup().await;
        let admin = user(&store, "admin", Role::Admin).await;

        let code = service.generate(admin.id).await.unwrap().code;
        let alice = service
            .use_invite(&code, User::new("alice", Role::Unknown))
            .await
            .unwrap();
        let code = service.generate(alice.id).await.unwrap().code;
        let bob = service
            .use_invite(&code, User::new("bob", Role::Unknown))
            .await
            .unwrap();

        let full = service.tree(admin.id).await.unwrap();
        assert_eq!(full[&admin.id].len(), 1);
        assert_eq!(full[&alice.id][0].id, bob.id);
        assert!(full[&bob.id].is_empty());

        let shallow = service.tree(alice.id).await.unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[&alice.id][0].username, "bob");

        assert!(matches!(
            service.tree(bob.id).await,
            Err(EidolonError::PermissionDenied(_))
        ));
    }
}
