//! Back-office operations.
//!
//! Every write runs the same pipeline: resolve the actor, check permission
//! codes (denials of writes are logged by the authorizer), check role rank
//! where another user or role is involved, hand over to the engine for
//! validation and persistence, then append an activity entry.

use std::sync::Arc;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::audit::AuditSink;
use crate::authz::{AccessRequest, Authorizer};
use crate::delivery::InvitationDelivery;
use crate::engine::{Engine, EngineError, PricePeriodFilter};
use crate::error::BackofficeError;
use crate::model::*;
use crate::permission::{self, *};
use crate::role::{self, Role};

type Result<T> = std::result::Result<T, BackofficeError>;

/// Direct user creation. Non-empty `permissions` additionally needs
/// `managePermissions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUser {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub permissions: Vec<PermissionCode>,
    pub hotel_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteUser {
    pub id: Ulid,
    pub email: String,
    pub role: String,
    pub hotel_id: Option<Ulid>,
}

pub struct Backoffice {
    engine: Arc<Engine>,
    authorizer: Authorizer,
    delivery: Arc<dyn InvitationDelivery>,
}

impl Backoffice {
    /// Audit entries go to the engine's own log.
    pub fn new(engine: Arc<Engine>, delivery: Arc<dyn InvitationDelivery>) -> Self {
        let sink: Arc<dyn AuditSink> = engine.clone();
        Self::with_audit_sink(engine, sink, delivery)
    }

    pub fn with_audit_sink(
        engine: Arc<Engine>,
        sink: Arc<dyn AuditSink>,
        delivery: Arc<dyn InvitationDelivery>,
    ) -> Self {
        Self {
            engine,
            authorizer: Authorizer::new(sink),
            delivery,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Session login to acting user. Looked up on every request so that
    /// blocking or deleting a user takes effect immediately.
    pub fn resolve(&self, login: &str) -> Option<User> {
        self.engine.resolve_login(login)
    }

    /// Bare permission check for operations served outside this crate.
    pub async fn authorize(
        &self,
        actor: Option<&User>,
        method: &'static str,
        route: &str,
        required: &[PermissionCode],
    ) -> Result<User> {
        let req = AccessRequest::new(method, route, required);
        Ok(self.authorizer.require(actor, &req).await?.clone())
    }

    async fn done(&self, actor: &User, req: &AccessRequest, detail: Option<String>) {
        debug!("{} {} by {}", req.method, req.route, actor.id);
        self.authorizer.record_activity(actor, req, detail).await;
    }

    fn target(&self, id: Ulid) -> Result<User> {
        self.engine
            .get_user(&id)
            .ok_or(BackofficeError::Engine(EngineError::NotFound(id)))
    }
}

fn parse_role(name: &str) -> Result<Role> {
    Role::parse(name).ok_or_else(|| EngineError::UnknownRole(name.to_string()).into())
}

// ── Users ────────────────────────────────────────────────────────

impl Backoffice {
    pub async fn create_user(&self, actor: Option<&User>, new: CreateUser) -> Result<User> {
        let mut required = vec![CREATE_USER];
        if !new.permissions.is_empty() {
            required.push(MANAGE_PERMISSIONS);
        }
        let req = AccessRequest::new("POST", "/users", &required);
        let actor = self.authorizer.require(actor, &req).await?;
        self.authorizer.require_manage(actor, &new.role, &req).await?;
        let role = parse_role(&new.role)?;

        let user = self
            .engine
            .create_user(NewUser {
                id: new.id,
                email: new.email,
                name: new.name,
                role,
                permissions: new.permissions,
                hotel_id: new.hotel_id,
                invited_by: None,
            })
            .await?;
        self.done(actor, &req, Some(format!("created user {}", user.id))).await;
        Ok(user)
    }

    /// Apply every part of `patch`. All parts are authorized before any is
    /// applied, so a denial never leaves a half-applied patch.
    pub async fn update_user(&self, actor: Option<&User>, id: Ulid, patch: UserPatch) -> Result<User> {
        let route = format!("/users/{id}");
        let mut required = Vec::new();
        if patch.profile != UserUpdate::default() || patch.role.is_some() || patch.blocked.is_some() {
            required.push(UPDATE_USER);
        }
        if patch.permissions.is_some() {
            required.push(MANAGE_PERMISSIONS);
        }
        let req = AccessRequest::new("PATCH", route, &required).on_user(id);
        let actor = self.authorizer.require(actor, &req).await?;
        let target = self.target(id)?;

        let acting_on_self = target.id == actor.id;
        let needs_rank = !acting_on_self
            || patch.role.is_some()
            || patch.permissions.is_some()
            || patch.blocked.is_some();
        if needs_rank {
            self.authorizer.require_manage(actor, &target.role, &req).await?;
        }
        if acting_on_self && patch.profile.hotel_id.is_some() {
            return Err(EngineError::Validation("users cannot change their own hotel").into());
        }
        let new_role = match &patch.role {
            Some(name) => {
                self.authorizer.require_manage(actor, name, &req).await?;
                Some(parse_role(name)?)
            }
            None => None,
        };
        if let Some(code) = patch.permissions.as_deref().and_then(first_unknown_permission) {
            return Err(EngineError::UnknownPermission(code).into());
        }

        let mut user = target;
        if patch.profile != UserUpdate::default() {
            user = self.engine.update_profile(id, patch.profile).await?;
        }
        if let Some(role) = new_role {
            user = self.engine.assign_role(id, role).await?;
        }
        if let Some(codes) = &patch.permissions {
            user = self.engine.set_permissions(id, codes).await?;
        }
        if let Some(blocked) = patch.blocked {
            user = self.engine.set_blocked(id, blocked).await?;
        }
        self.done(actor, &req, None).await;
        Ok(user)
    }

    pub async fn update_profile(&self, actor: Option<&User>, id: Ulid, update: UserUpdate) -> Result<User> {
        let patch = UserPatch {
            profile: update,
            ..Default::default()
        };
        self.update_user(actor, id, patch).await
    }

    pub async fn assign_role(&self, actor: Option<&User>, id: Ulid, role: &str) -> Result<User> {
        let patch = UserPatch {
            role: Some(role.to_string()),
            ..Default::default()
        };
        self.update_user(actor, id, patch).await
    }

    pub async fn set_permissions(
        &self,
        actor: Option<&User>,
        id: Ulid,
        codes: Vec<PermissionCode>,
    ) -> Result<User> {
        let patch = UserPatch {
            permissions: Some(codes),
            ..Default::default()
        };
        self.update_user(actor, id, patch).await
    }

    pub async fn set_blocked(&self, actor: Option<&User>, id: Ulid, blocked: bool) -> Result<User> {
        let patch = UserPatch {
            blocked: Some(blocked),
            ..Default::default()
        };
        self.update_user(actor, id, patch).await
    }

    pub async fn delete_user(&self, actor: Option<&User>, id: Ulid) -> Result<User> {
        let req = AccessRequest::new("DELETE", format!("/users/{id}"), &[DELETE_USER]).on_user(id);
        let actor = self.authorizer.require(actor, &req).await?;
        let target = self.target(id)?;
        self.authorizer.require_manage(actor, &target.role, &req).await?;
        let user = self.engine.delete_user(id).await?;
        self.done(actor, &req, None).await;
        Ok(user)
    }

    /// Admin sees every user. Everyone else sees themselves plus the users
    /// whose role they may manage, limited to their own hotel when they
    /// belong to one.
    pub async fn list_users(&self, actor: Option<&User>) -> Result<Vec<User>> {
        let req = AccessRequest::new("GET", "/users", &[READ_USER]);
        let actor = self.authorizer.require(actor, &req).await?;
        let users = self.engine.list_users();
        if actor.is_admin() {
            return Ok(users);
        }
        let manageable = role::manageable_roles(&actor.role);
        Ok(users
            .into_iter()
            .filter(|u| {
                u.id == actor.id
                    || (u.role().is_some_and(|r| manageable.contains(&r))
                        && actor.hotel_id.is_none_or(|h| u.hotel_id == Some(h)))
            })
            .collect())
    }

    /// Roles the actor may invite or assign, most senior first.
    pub async fn list_roles(&self, actor: Option<&User>) -> Result<Vec<Role>> {
        let req = AccessRequest::new("GET", "/roles", &[]);
        let actor = self.authorizer.require(actor, &req).await?;
        Ok(role::manageable_roles(&actor.role).into_iter().collect())
    }

    pub async fn list_permissions(
        &self,
        actor: Option<&User>,
    ) -> Result<Vec<(PermissionCode, &'static str, permission::Action)>> {
        let req = AccessRequest::new("GET", "/permissions", &[]);
        self.authorizer.require(actor, &req).await?;
        Ok(permission::catalog())
    }
}

// ── Invitations ──────────────────────────────────────────────────

impl Backoffice {
    pub async fn invite_user(&self, actor: Option<&User>, invite: InviteUser) -> Result<Invitation> {
        let req = AccessRequest::new("POST", "/invitations", &[INVITE_USER]);
        let actor = self.authorizer.require(actor, &req).await?;
        self.authorizer.require_manage(actor, &invite.role, &req).await?;
        let role = parse_role(&invite.role)?;

        let invitation = self
            .engine
            .create_invitation(invite.id, invite.email, role, invite.hotel_id, actor.id)
            .await?;
        if let Err(e) = self.delivery.deliver(&invitation).await {
            warn!("invitation {} stored but not delivered: {e}", invitation.id);
        }
        self.done(actor, &req, Some(format!("invited {} as {role}", invitation.email))).await;
        Ok(invitation)
    }

    /// Accept an invitation on behalf of the session that logged in with the
    /// invited e-mail. No user exists for that login yet, so there is no
    /// permission check; the e-mail match is the credential.
    pub async fn accept_invitation(&self, login_email: &str, id: Ulid, name: String) -> Result<User> {
        let user = self.engine.accept_invitation(id, login_email, name).await?;
        let req = AccessRequest::new("POST", format!("/invitations/{id}/accept"), &[]);
        self.done(&user, &req, None).await;
        Ok(user)
    }

    pub async fn revoke_invitation(&self, actor: Option<&User>, id: Ulid) -> Result<Invitation> {
        let req = AccessRequest::new("DELETE", format!("/invitations/{id}"), &[INVITE_USER]);
        let actor = self.authorizer.require(actor, &req).await?;
        let invitation = self
            .engine
            .get_invitation(&id)
            .ok_or(BackofficeError::Engine(EngineError::NotFound(id)))?;
        self.authorizer
            .require_manage(actor, invitation.role.as_str(), &req)
            .await?;
        let revoked = self.engine.revoke_invitation(id).await?;
        self.done(actor, &req, None).await;
        Ok(revoked)
    }

    pub async fn list_invitations(&self, actor: Option<&User>) -> Result<Vec<Invitation>> {
        let req = AccessRequest::new("GET", "/invitations", &[INVITE_USER]);
        let actor = self.authorizer.require(actor, &req).await?;
        let invitations = self.engine.list_invitations();
        if actor.is_admin() {
            return Ok(invitations);
        }
        Ok(invitations
            .into_iter()
            .filter(|i| i.invited_by == actor.id || actor.role().is_some_and(|r| r.can_manage(i.role)))
            .collect())
    }
}

// ── Stays, price periods and invoices ────────────────────────────

impl Backoffice {
    pub async fn create_stay(&self, actor: Option<&User>, new: NewStay) -> Result<Stay> {
        let req = AccessRequest::new("POST", "/stays", &[CREATE_STAY]);
        let actor = self.authorizer.require(actor, &req).await?;
        let stay = self.engine.create_stay(actor.id, new).await?;
        self.done(actor, &req, Some(format!("stay {}", stay.id))).await;
        Ok(stay)
    }

    pub async fn update_stay(
        &self,
        actor: Option<&User>,
        id: Ulid,
        update: StayUpdate,
    ) -> Result<(Stay, Option<Invoice>)> {
        let req = AccessRequest::new("PATCH", format!("/stays/{id}"), &[UPDATE_STAY]);
        let actor = self.authorizer.require(actor, &req).await?;
        let (stay, invoice) = self.engine.update_stay(id, update).await?;
        let detail = invoice.as_ref().map(|i| format!("opened invoice {}", i.id));
        self.done(actor, &req, detail).await;
        Ok((stay, invoice))
    }

    pub async fn delete_stay(&self, actor: Option<&User>, id: Ulid) -> Result<Stay> {
        let req = AccessRequest::new("DELETE", format!("/stays/{id}"), &[DELETE_STAY]);
        let actor = self.authorizer.require(actor, &req).await?;
        let stay = self.engine.delete_stay(id).await?;
        self.done(actor, &req, None).await;
        Ok(stay)
    }

    pub async fn list_stays(&self, actor: Option<&User>, room_id: Option<Ulid>) -> Result<Vec<Stay>> {
        let req = AccessRequest::new("GET", "/stays", &[READ_STAY]);
        self.authorizer.require(actor, &req).await?;
        Ok(self.engine.list_stays(room_id))
    }

    pub async fn create_price_period(&self, actor: Option<&User>, new: NewPricePeriod) -> Result<PricePeriod> {
        let req = AccessRequest::new("POST", "/price-periods", &[CREATE_PRICE_PERIOD]);
        let actor = self.authorizer.require(actor, &req).await?;
        let period = self.engine.create_price_period(actor.id, new).await?;
        self.done(actor, &req, Some(format!("price period {}", period.id))).await;
        Ok(period)
    }

    pub async fn update_price_period(
        &self,
        actor: Option<&User>,
        id: Ulid,
        update: PricePeriodUpdate,
    ) -> Result<PricePeriod> {
        let req = AccessRequest::new("PATCH", format!("/price-periods/{id}"), &[UPDATE_PRICE_PERIOD]);
        let actor = self.authorizer.require(actor, &req).await?;
        let period = self.engine.update_price_period(id, update).await?;
        self.done(actor, &req, None).await;
        Ok(period)
    }

    pub async fn delete_price_period(&self, actor: Option<&User>, id: Ulid) -> Result<PricePeriod> {
        let req = AccessRequest::new("DELETE", format!("/price-periods/{id}"), &[DELETE_PRICE_PERIOD]);
        let actor = self.authorizer.require(actor, &req).await?;
        let period = self.engine.delete_price_period(id).await?;
        self.done(actor, &req, None).await;
        Ok(period)
    }

    pub async fn list_price_periods(
        &self,
        actor: Option<&User>,
        filter: PricePeriodFilter,
    ) -> Result<Vec<PricePeriod>> {
        let req = AccessRequest::new("GET", "/price-periods", &[READ_PRICE_PERIOD]);
        self.authorizer.require(actor, &req).await?;
        Ok(self.engine.list_price_periods(filter))
    }

    pub async fn effective_price(
        &self,
        actor: Option<&User>,
        entity_type: EntityType,
        entity_id: Ulid,
        at: Ms,
    ) -> Result<Option<PricePeriod>> {
        let req = AccessRequest::new("GET", "/prices", &[READ_PRICE_PERIOD]);
        self.authorizer.require(actor, &req).await?;
        Ok(self.engine.effective_price(entity_type, entity_id, at).await)
    }

    pub async fn list_invoices(&self, actor: Option<&User>, stay_id: Option<Ulid>) -> Result<Vec<Invoice>> {
        let req = AccessRequest::new("GET", "/invoices", &[READ_INVOICE]);
        self.authorizer.require(actor, &req).await?;
        Ok(self.engine.list_invoices(stay_id))
    }
}

// ── Activity log ─────────────────────────────────────────────────

impl Backoffice {
    pub async fn list_audit(&self, actor: Option<&User>) -> Result<Vec<AuditEntry>> {
        let req = AccessRequest::new("GET", "/logs", &[READ_LOG]);
        self.authorizer.require(actor, &req).await?;
        Ok(self.engine.list_audit())
    }

    pub async fn delete_audit_entry(&self, actor: Option<&User>, id: Ulid) -> Result<AuditEntry> {
        let req = AccessRequest::new("DELETE", format!("/logs/{id}"), &[DELETE_LOG]);
        let actor = self.authorizer.require(actor, &req).await?;
        let entry = self.engine.hide_audit_entry(id).await?;
        self.done(actor, &req, None).await;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;

    use super::*;
    use crate::audit::AuditError;
    use crate::authz::AuthzError;
    use crate::delivery::LogDelivery;

    const DAY: Ms = 86_400_000;
    const JAN_10: Ms = 1_704_844_800_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staydesk_test_backoffice");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str) -> (Backoffice, User) {
        let engine = Arc::new(Engine::new(test_wal_path(name), 7 * DAY).unwrap());
        let admin = engine.bootstrap_admin("admin@hotel.test").await.unwrap().unwrap();
        (Backoffice::new(engine, Arc::new(LogDelivery)), admin)
    }

    async fn make_user(bo: &Backoffice, admin: &User, email: &str, role: &str, codes: &[PermissionCode]) -> User {
        bo.create_user(
            Some(admin),
            CreateUser {
                id: Ulid::new(),
                email: email.into(),
                name: email.into(),
                role: role.into(),
                permissions: codes.to_vec(),
                hotel_id: None,
            },
        )
        .await
        .unwrap()
    }

    fn denied(entries: &[AuditEntry]) -> Vec<&AuditEntry> {
        entries.iter().filter(|e| e.outcome == AuditOutcome::Denied).collect()
    }

    #[tokio::test]
    async fn manager_without_delete_room_is_denied_and_logged() {
        let (bo, admin) = setup("room_delete_denied.wal").await;
        let manager = make_user(&bo, &admin, "hm@hotel.test", "hotelManager", &[CREATE_ROOM]).await;

        let err = bo
            .authorize(Some(&manager), "DELETE", "/rooms/42", &[DELETE_ROOM])
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.code(), "permission_denied");

        let log = bo.engine().list_audit();
        let denials = denied(&log);
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].required, vec![8004]);
        assert_eq!(denials[0].actual, vec![8001]);
        assert_eq!(denials[0].user_id, manager.id);
        assert_eq!(denials[0].route, "/rooms/42");
    }

    #[tokio::test]
    async fn zone_agent_cannot_invite_city_agent() {
        let (bo, admin) = setup("zone_invites_city.wal").await;
        let zone = make_user(&bo, &admin, "zone@hotel.test", "zoneAgent", &[INVITE_USER]).await;
        let city = make_user(&bo, &admin, "city@hotel.test", "cityAgent", &[INVITE_USER]).await;

        let err = bo
            .invite_user(
                Some(&zone),
                InviteUser {
                    id: Ulid::new(),
                    email: "new-city@hotel.test".into(),
                    role: "cityAgent".into(),
                    hotel_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackofficeError::Authz(AuthzError::RoleRank { .. })));
        assert_eq!(err.http_status(), 403);

        let invitation = bo
            .invite_user(
                Some(&city),
                InviteUser {
                    id: Ulid::new(),
                    email: "new-zone@hotel.test".into(),
                    role: "zoneAgent".into(),
                    hotel_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(invitation.role, Role::ZoneAgent);
        assert_eq!(invitation.invited_by, city.id);

        let user = bo
            .accept_invitation("NEW-ZONE@hotel.test", invitation.id, "Zed".into())
            .await
            .unwrap();
        assert_eq!(user.role, "zoneAgent");
        assert_eq!(user.invited_by, Some(city.id));
    }

    #[tokio::test]
    async fn admin_bypasses_permission_codes() {
        let (bo, admin) = setup("admin_bypass.wal").await;
        assert!(admin.permissions.is_empty());
        let stay = bo
            .create_stay(
                Some(&admin),
                NewStay {
                    id: Ulid::new(),
                    client_id: Ulid::new(),
                    room_id: Ulid::new(),
                    start: JAN_10,
                    end: JAN_10 + 5 * DAY,
                    status: StayStatus::Confirmed,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let log = bo.engine().list_audit();
        assert!(log.iter().any(|e| e.outcome == AuditOutcome::Success
            && e.route == "/stays"
            && e.detail == Some(format!("stay {}", stay.id))));
    }

    #[tokio::test]
    async fn overlap_conflict_surfaces_as_409() {
        let (bo, admin) = setup("conflict_409.wal").await;
        let clerk = make_user(&bo, &admin, "clerk@hotel.test", "owner", &[CREATE_STAY]).await;
        let room = Ulid::new();
        let new = |start, end| NewStay {
            id: Ulid::new(),
            client_id: Ulid::new(),
            room_id: room,
            start,
            end,
            status: StayStatus::Confirmed,
            notes: None,
        };
        bo.create_stay(Some(&clerk), new(JAN_10, JAN_10 + 5 * DAY)).await.unwrap();

        let err = bo
            .create_stay(Some(&clerk), new(JAN_10 + 4 * DAY, JAN_10 + 10 * DAY))
            .await
            .unwrap_err();
        assert_eq!((err.http_status(), err.code(), err.sqlstate()), (409, "overlap_conflict", "23P01"));

        let err = bo.create_stay(Some(&clerk), new(JAN_10, JAN_10)).await.unwrap_err();
        assert_eq!((err.http_status(), err.code()), (400, "invalid_range"));
    }

    #[tokio::test]
    async fn unauthenticated_actor_is_rejected() {
        let (bo, _admin) = setup("unauthenticated.wal").await;
        let err = bo.list_stays(None, None).await.unwrap_err();
        assert!(matches!(err, BackofficeError::Authz(AuthzError::Unauthenticated)));
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _entry: AuditEntry) -> std::result::Result<(), AuditError> {
            Err(AuditError("log volume unavailable".into()))
        }
    }

    #[tokio::test]
    async fn audit_failure_never_escalates() {
        let engine = Arc::new(Engine::new(test_wal_path("audit_failure.wal"), 7 * DAY).unwrap());
        let admin = engine.bootstrap_admin("admin@hotel.test").await.unwrap().unwrap();
        let bo = Backoffice::with_audit_sink(engine, Arc::new(FailingSink), Arc::new(LogDelivery));
        let manager = make_user(&bo, &admin, "hm@hotel.test", "hotelManager", &[CREATE_ROOM]).await;

        let err = bo
            .authorize(Some(&manager), "DELETE", "/rooms/42", &[DELETE_ROOM])
            .await
            .unwrap_err();
        assert!(matches!(err, BackofficeError::Authz(AuthzError::Forbidden { .. })));
        assert!(bo.engine().list_audit().is_empty());
    }

    #[tokio::test]
    async fn self_update_without_permission() {
        let (bo, admin) = setup("self_update.wal").await;
        let owner = make_user(&bo, &admin, "own@hotel.test", "owner", &[]).await;

        let updated = bo
            .update_profile(
                Some(&owner),
                owner.id,
                UserUpdate {
                    name: Some("Renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");

        // Self-service covers the profile only.
        let err = bo.assign_role(Some(&owner), owner.id, "owner").await.unwrap_err();
        assert_eq!(err.http_status(), 403);
        let err = bo.set_blocked(Some(&owner), owner.id, true).await.unwrap_err();
        assert_eq!(err.http_status(), 403);
        let err = bo
            .update_profile(
                Some(&owner),
                owner.id,
                UserUpdate {
                    hotel_id: Some(Some(Ulid::new())),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn patch_is_all_or_nothing() {
        let (bo, admin) = setup("patch_atomic.wal").await;
        let director = make_user(&bo, &admin, "dir@hotel.test", "hotelDirector", &[UPDATE_USER, MANAGE_PERMISSIONS]).await;
        let manager = make_user(&bo, &admin, "man@hotel.test", "hotelManager", &[]).await;

        // Renaming is fine, promoting to a rank the director does not out-rank is not.
        let err = bo
            .update_user(
                Some(&director),
                manager.id,
                UserPatch {
                    profile: UserUpdate {
                        name: Some("Should not stick".into()),
                        ..Default::default()
                    },
                    role: Some("hotelDirector".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackofficeError::Authz(AuthzError::RoleRank { .. })));
        assert_eq!(bo.engine().get_user(&manager.id).unwrap().name, "man@hotel.test");

        let updated = bo
            .update_user(
                Some(&director),
                manager.id,
                UserPatch {
                    role: Some("restaurantManager".into()),
                    permissions: Some(vec![READ_STAY, CREATE_FOOD_ORDER]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.role, "restaurantManager");
        assert_eq!(updated.permission_list(), vec![READ_STAY, CREATE_FOOD_ORDER]);
    }

    #[tokio::test]
    async fn sibling_managers_cannot_administer_each_other() {
        let (bo, admin) = setup("siblings.wal").await;
        let hm = make_user(&bo, &admin, "hm@hotel.test", "hotelManager", &[UPDATE_USER, DELETE_USER]).await;
        let rm = make_user(&bo, &admin, "rm@hotel.test", "restaurantManager", &[]).await;
        assert!(bo.set_blocked(Some(&hm), rm.id, true).await.is_err());
        assert!(bo.delete_user(Some(&hm), rm.id).await.is_err());
        assert!(bo.engine().resolve_login("rm@hotel.test").is_some());
    }

    #[tokio::test]
    async fn unknown_role_is_a_logged_denial() {
        let (bo, admin) = setup("unknown_role_denied.wal").await;
        let err = bo
            .create_user(
                Some(&admin),
                CreateUser {
                    id: Ulid::new(),
                    email: "ghost@hotel.test".into(),
                    name: "Ghost".into(),
                    role: "superAdmin".into(),
                    permissions: vec![],
                    hotel_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackofficeError::Authz(AuthzError::RoleRank { .. })));
        assert_eq!(err.http_status(), 403);

        let err = bo
            .invite_user(
                Some(&admin),
                InviteUser {
                    id: Ulid::new(),
                    email: "ghost@hotel.test".into(),
                    role: "superAdmin".into(),
                    hotel_id: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);

        let log = bo.engine().list_audit();
        let denials = denied(&log);
        assert_eq!(denials.len(), 2);
        assert!(denials.iter().all(|e| e.user_id == admin.id && e.required.is_empty()));
        assert!(bo.engine().resolve_login("ghost@hotel.test").is_none());
    }

    #[tokio::test]
    async fn unknown_permission_codes_rejected() {
        let (bo, admin) = setup("unknown_codes.wal").await;
        let user = make_user(&bo, &admin, "u@hotel.test", "owner", &[]).await;
        let err = bo.set_permissions(Some(&admin), user.id, vec![8001, 31337]).await.unwrap_err();
        assert_eq!(err.code(), "unknown_permission");
    }

    #[tokio::test]
    async fn list_users_is_scoped() {
        let (bo, admin) = setup("list_scoped.wal").await;
        let hotel = Ulid::new();
        let other_hotel = Ulid::new();
        let director = bo
            .create_user(
                Some(&admin),
                CreateUser {
                    id: Ulid::new(),
                    email: "dir@hotel.test".into(),
                    name: "Director".into(),
                    role: "hotelDirector".into(),
                    permissions: vec![READ_USER],
                    hotel_id: Some(hotel),
                },
            )
            .await
            .unwrap();
        let mut ids = Vec::new();
        for (email, role, h) in [
            ("m1@hotel.test", "hotelManager", Some(hotel)),
            ("m2@hotel.test", "hotelManager", Some(other_hotel)),
            ("ag@hotel.test", "zoneAgent", Some(hotel)),
        ] {
            let u = bo
                .create_user(
                    Some(&admin),
                    CreateUser {
                        id: Ulid::new(),
                        email: email.into(),
                        name: email.into(),
                        role: role.into(),
                        permissions: vec![],
                        hotel_id: h,
                    },
                )
                .await
                .unwrap();
            ids.push(u.id);
        }

        let seen: Vec<Ulid> = bo
            .list_users(Some(&director))
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert!(seen.contains(&director.id));
        assert!(seen.contains(&ids[0]));
        assert!(!seen.contains(&ids[1]), "other hotel");
        assert!(!seen.contains(&ids[2]), "senior role");
        assert!(!seen.contains(&admin.id));

        assert_eq!(bo.list_users(Some(&admin)).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn list_roles_returns_manageable_roles() {
        let (bo, admin) = setup("list_roles.wal").await;
        let hm = make_user(&bo, &admin, "hm@hotel.test", "hotelManager", &[]).await;
        assert_eq!(bo.list_roles(Some(&hm)).await.unwrap(), vec![Role::Owner]);
        assert_eq!(bo.list_roles(Some(&admin)).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn only_activity_entries_can_be_deleted() {
        let (bo, admin) = setup("log_delete.wal").await;
        let manager = make_user(&bo, &admin, "hm@hotel.test", "hotelManager", &[]).await;
        let _ = bo.authorize(Some(&manager), "DELETE", "/rooms/1", &[DELETE_ROOM]).await;

        let log = bo.list_audit(Some(&admin)).await.unwrap();
        let denial = log.iter().find(|e| e.outcome == AuditOutcome::Denied).unwrap();
        let activity = log.iter().find(|e| e.outcome == AuditOutcome::Success).unwrap();

        let err = bo.delete_audit_entry(Some(&admin), denial.id).await.unwrap_err();
        assert_eq!(err.code(), "immutable");
        bo.delete_audit_entry(Some(&admin), activity.id).await.unwrap();

        let err = bo.list_audit(Some(&manager)).await.unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn completing_stay_through_backoffice_opens_invoice() {
        let (bo, admin) = setup("complete_invoice.wal").await;
        let stay = bo
            .create_stay(
                Some(&admin),
                NewStay {
                    id: Ulid::new(),
                    client_id: Ulid::new(),
                    room_id: Ulid::new(),
                    start: JAN_10,
                    end: JAN_10 + DAY,
                    status: StayStatus::InProgress,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let (done, invoice) = bo
            .update_stay(
                Some(&admin),
                stay.id,
                StayUpdate {
                    status: Some(StayStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, StayStatus::Completed);
        let invoice = invoice.unwrap();
        assert_eq!(bo.list_invoices(Some(&admin), Some(stay.id)).await.unwrap(), vec![invoice]);

        let err = bo
            .update_stay(Some(&admin), stay.id, StayUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "stay_completed");
    }
}
