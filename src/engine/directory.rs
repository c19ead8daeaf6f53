use std::collections::BTreeSet;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::permission::PermissionCode;
use crate::role::Role;

use super::conflict::now_ms;
use super::{Engine, EngineError};

fn validate_email(email: &str) -> Result<(), EngineError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(EngineError::Validation("email must contain '@'"));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(EngineError::Validation("email must have a local part and a domain"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn permission_set(codes: &[PermissionCode]) -> Result<BTreeSet<PermissionCode>, EngineError> {
    if let Some(code) = first_unknown_permission(codes) {
        return Err(EngineError::UnknownPermission(code));
    }
    let set: BTreeSet<PermissionCode> = codes.iter().copied().collect();
    if set.len() > MAX_PERMISSIONS_PER_USER {
        return Err(EngineError::LimitExceeded("too many permissions"));
    }
    Ok(set)
}

// ── Users ────────────────────────────────────────────────────────

impl Engine {
    pub async fn create_user(&self, new: NewUser) -> Result<User, EngineError> {
        validate_email(&new.email)?;
        validate_name(&new.name)?;
        let permissions = permission_set(&new.permissions)?;

        let _directory = self.directory_lock.lock().await;
        if self.users.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(format!("user {}", new.id)));
        }
        if self.emails.contains_key(&new.email.to_lowercase()) {
            return Err(EngineError::AlreadyExists(format!("email {}", new.email)));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let user = User {
            id: new.id,
            email: new.email,
            name: new.name,
            role: new.role.as_str().to_string(),
            permissions,
            hotel_id: new.hotel_id,
            invited_by: new.invited_by,
            blocked: false,
            deleted: false,
            created_at: now_ms(),
        };
        self.persist(&[Event::UserCreated { user: user.clone() }]).await?;
        Ok(user)
    }

    pub async fn update_profile(&self, id: Ulid, update: UserUpdate) -> Result<User, EngineError> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(email) = &update.email {
            validate_email(email)?;
        }

        let _directory = self.directory_lock.lock().await;
        let current = self.live_user(&id)?;
        let email = update.email.unwrap_or_else(|| current.email.clone());
        if let Some(holder) = self.emails.get(&email.to_lowercase())
            && *holder != id
        {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }
        let name = update.name.unwrap_or_else(|| current.name.clone());
        let hotel_id = update.hotel_id.unwrap_or(current.hotel_id);
        if name == current.name && email == current.email && hotel_id == current.hotel_id {
            return Ok(current);
        }

        self.persist(&[Event::UserProfileUpdated { id, name, email, hotel_id }]).await?;
        self.live_user(&id)
    }

    pub async fn assign_role(&self, id: Ulid, role: Role) -> Result<User, EngineError> {
        let _directory = self.directory_lock.lock().await;
        let current = self.live_user(&id)?;
        if current.role == role.as_str() {
            return Ok(current);
        }
        self.persist(&[Event::RoleAssigned { id, role: role.as_str().to_string() }]).await?;
        self.live_user(&id)
    }

    /// Replace the user's permission set. Every code must be in the catalog.
    pub async fn set_permissions(
        &self,
        id: Ulid,
        codes: &[PermissionCode],
    ) -> Result<User, EngineError> {
        let permissions = permission_set(codes)?;
        let _directory = self.directory_lock.lock().await;
        self.live_user(&id)?;
        self.persist(&[Event::PermissionsSet { id, permissions }]).await?;
        self.live_user(&id)
    }

    pub async fn set_blocked(&self, id: Ulid, blocked: bool) -> Result<User, EngineError> {
        let _directory = self.directory_lock.lock().await;
        let current = self.live_user(&id)?;
        if current.blocked == blocked {
            return Ok(current);
        }
        self.persist(&[Event::UserBlocked { id, blocked }]).await?;
        self.live_user(&id)
    }

    /// Users are never hard-deleted; the flag frees the e-mail for reuse.
    pub async fn delete_user(&self, id: Ulid) -> Result<User, EngineError> {
        let _directory = self.directory_lock.lock().await;
        let mut user = self.live_user(&id)?;
        self.persist(&[Event::UserDeleted { id }]).await?;
        user.deleted = true;
        Ok(user)
    }

    /// Non-deleted user by id. Blocked users are still returned.
    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users
            .get(id)
            .filter(|u| !u.deleted)
            .map(|u| u.value().clone())
    }

    /// Resolve a session login (user id or e-mail) to an active user.
    /// Blocked and deleted users do not resolve.
    pub fn resolve_login(&self, login: &str) -> Option<User> {
        let id = match Ulid::from_string(login) {
            Ok(id) => id,
            Err(_) => *self.emails.get(&login.to_lowercase())?,
        };
        self.get_user(&id).filter(User::is_active)
    }

    /// Seed an admin into an empty directory. Returns `None` when any user,
    /// deleted or not, already exists.
    pub async fn bootstrap_admin(&self, email: &str) -> Result<Option<User>, EngineError> {
        if !self.users.is_empty() {
            return Ok(None);
        }
        let user = self
            .create_user(NewUser {
                id: Ulid::new(),
                email: email.to_string(),
                name: "Administrator".to_string(),
                role: Role::Admin,
                permissions: Vec::new(),
                hotel_id: None,
                invited_by: None,
            })
            .await?;
        info!("bootstrapped admin user {} <{}>", user.id, user.email);
        Ok(Some(user))
    }

    fn live_user(&self, id: &Ulid) -> Result<User, EngineError> {
        self.get_user(id).ok_or(EngineError::NotFound(*id))
    }
}

// ── Invitations ──────────────────────────────────────────────────

impl Engine {
    pub async fn create_invitation(
        &self,
        id: Ulid,
        email: String,
        role: Role,
        hotel_id: Option<Ulid>,
        invited_by: Ulid,
    ) -> Result<Invitation, EngineError> {
        validate_email(&email)?;
        let _directory = self.directory_lock.lock().await;
        if self.invitations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("invitation {id}")));
        }
        let now = now_ms();
        if self.emails.contains_key(&email.to_lowercase()) || self.pending_invitation(&email, now).is_some() {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }

        let invitation = Invitation {
            id,
            email,
            role,
            hotel_id,
            invited_by,
            created_at: now,
            expires_at: now.saturating_add(self.invitation_ttl_ms),
            state: InvitationState::Pending,
        };
        self.persist(&[Event::InvitationCreated { invitation: invitation.clone() }]).await?;
        Ok(invitation)
    }

    /// Turn a pending invitation into a user. `login_email` is the e-mail the
    /// session authenticated with and must match the invited address.
    pub async fn accept_invitation(
        &self,
        id: Ulid,
        login_email: &str,
        name: String,
    ) -> Result<User, EngineError> {
        validate_name(&name)?;
        let _directory = self.directory_lock.lock().await;
        let invitation = self
            .invitations
            .get(&id)
            .map(|i| i.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let now = now_ms();
        if !invitation.is_pending(now) {
            return Err(EngineError::Validation("invitation is no longer pending"));
        }
        if !invitation.email.eq_ignore_ascii_case(login_email) {
            // Indistinguishable from a missing invitation for other logins.
            return Err(EngineError::NotFound(id));
        }
        if self.emails.contains_key(&invitation.email.to_lowercase()) {
            return Err(EngineError::AlreadyExists(format!("email {}", invitation.email)));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let user = User {
            id: Ulid::new(),
            email: invitation.email.clone(),
            name,
            role: invitation.role.as_str().to_string(),
            permissions: BTreeSet::new(),
            hotel_id: invitation.hotel_id,
            invited_by: Some(invitation.invited_by),
            blocked: false,
            deleted: false,
            created_at: now,
        };
        self.persist(&[
            Event::UserCreated { user: user.clone() },
            Event::InvitationStateChanged {
                id,
                state: InvitationState::Accepted { user_id: user.id },
            },
        ])
        .await?;
        Ok(user)
    }

    pub async fn revoke_invitation(&self, id: Ulid) -> Result<Invitation, EngineError> {
        let _directory = self.directory_lock.lock().await;
        let invitation = self.get_invitation(&id).ok_or(EngineError::NotFound(id))?;
        if invitation.state != InvitationState::Pending {
            return Err(EngineError::Validation("invitation is no longer pending"));
        }
        self.persist(&[Event::InvitationStateChanged { id, state: InvitationState::Revoked }])
            .await?;
        self.get_invitation(&id).ok_or(EngineError::NotFound(id))
    }

    /// Pending invitations whose deadline has passed at `now`.
    pub fn collect_expired_invitations(&self, now: Ms) -> Vec<Ulid> {
        self.invitations
            .iter()
            .filter(|i| i.state == InvitationState::Pending && i.expires_at <= now)
            .map(|i| i.id)
            .collect()
    }

    /// Mark a lapsed invitation expired. A no-op when it was accepted or
    /// revoked in the meantime.
    pub async fn expire_invitation(&self, id: Ulid) -> Result<bool, EngineError> {
        let _directory = self.directory_lock.lock().await;
        let Some(invitation) = self.get_invitation(&id) else {
            return Ok(false);
        };
        if invitation.state != InvitationState::Pending || invitation.expires_at > now_ms() {
            return Ok(false);
        }
        self.persist(&[Event::InvitationStateChanged { id, state: InvitationState::Expired }])
            .await?;
        Ok(true)
    }

    pub fn get_invitation(&self, id: &Ulid) -> Option<Invitation> {
        self.invitations.get(id).map(|i| i.value().clone())
    }

    /// The pending, unexpired invitation addressed to `email`, if any.
    pub fn pending_invitation(&self, email: &str, now: Ms) -> Option<Invitation> {
        self.invitations
            .iter()
            .find(|i| i.is_pending(now) && i.email.eq_ignore_ascii_case(email))
            .map(|i| i.value().clone())
    }
}

// ── Activity and denial log ──────────────────────────────────────

impl Engine {
    pub async fn record_audit(&self, entry: AuditEntry) -> Result<(), EngineError> {
        if entry.route.len() > MAX_ROUTE_LEN {
            return Err(EngineError::LimitExceeded("route too long"));
        }
        if self.audit.contains_key(&entry.id) {
            return Err(EngineError::AlreadyExists(format!("audit entry {}", entry.id)));
        }
        self.persist(&[Event::AuditRecorded { entry }]).await
    }

    /// Hide an activity entry from listings. Denial entries are append-only.
    pub async fn hide_audit_entry(&self, id: Ulid) -> Result<AuditEntry, EngineError> {
        let entry = self
            .audit
            .get(&id)
            .filter(|e| !e.hidden)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if entry.outcome == AuditOutcome::Denied {
            return Err(EngineError::Immutable(id));
        }
        self.persist(&[Event::AuditHidden { id }]).await?;
        Ok(AuditEntry { hidden: true, ..entry })
    }
}
