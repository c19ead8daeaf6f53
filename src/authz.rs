//! Permission evaluator.
//!
//! `has_permission` is the single decision point for permission codes; the
//! admin bypass is its first branch. `Authorizer` wraps it with the denial
//! side effect: every denied write is appended to the audit sink before the
//! denial is returned. Sink failures are logged and counted, never surfaced.

use std::sync::Arc;

use tracing::warn;
use ulid::Ulid;

use crate::audit::AuditSink;
use crate::engine::now_ms;
use crate::model::{AuditEntry, AuditOutcome, User};
use crate::observability;
use crate::permission::{self, PermissionCode};
use crate::role;

/// Admin passes every check regardless of its permission set. Everyone else
/// needs every required code, except that `updateUser` on one's own record
/// is always allowed.
pub fn has_permission(user: &User, required: &[PermissionCode], target_user: Option<Ulid>) -> bool {
    if user.is_admin() {
        return true;
    }
    required.iter().all(|code| {
        user.permissions.contains(code)
            || (*code == permission::UPDATE_USER && target_user == Some(user.id))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// No user resolved for the session.
    Unauthenticated,
    Forbidden {
        required: Vec<PermissionCode>,
        actual: Vec<PermissionCode>,
    },
    /// The actor's role does not out-rank the role it tried to act on.
    RoleRank {
        actor_role: String,
        target_role: String,
    },
}

impl std::fmt::Display for AuthzError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthzError::Unauthenticated => write!(f, "not authenticated"),
            AuthzError::Forbidden { required, .. } => {
                write!(f, "permission denied: requires {required:?}")
            }
            AuthzError::RoleRank { actor_role, target_role } => {
                write!(f, "permission denied: {actor_role} cannot manage {target_role}")
            }
        }
    }
}

impl std::error::Error for AuthzError {}

/// What a caller is trying to do, in the terms the audit log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub method: &'static str,
    pub route: String,
    pub required: Vec<PermissionCode>,
    /// The user record the request acts on, when it acts on one.
    pub target_user: Option<Ulid>,
}

impl AccessRequest {
    pub fn new(method: &'static str, route: impl Into<String>, required: &[PermissionCode]) -> Self {
        Self {
            method,
            route: route.into(),
            required: required.to_vec(),
            target_user: None,
        }
    }

    pub fn on_user(mut self, id: Ulid) -> Self {
        self.target_user = Some(id);
        self
    }

    pub fn is_write(&self) -> bool {
        self.method != "GET"
    }
}

pub struct Authorizer {
    sink: Arc<dyn AuditSink>,
}

impl Authorizer {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Resolve the actor and check the request's permission codes.
    pub async fn require<'a>(
        &self,
        actor: Option<&'a User>,
        req: &AccessRequest,
    ) -> Result<&'a User, AuthzError> {
        let Some(user) = actor else {
            return Err(AuthzError::Unauthenticated);
        };
        if has_permission(user, &req.required, req.target_user) {
            return Ok(user);
        }

        metrics::counter!(observability::PERMISSION_DENIALS_TOTAL, "reason" => "permission")
            .increment(1);
        if req.is_write() {
            self.append(denial(user, req, None)).await;
        }
        Err(AuthzError::Forbidden {
            required: req.required.clone(),
            actual: user.permission_list(),
        })
    }

    /// Check that `actor` out-ranks `target_role`. Unknown roles on either
    /// side fail closed.
    pub async fn require_manage(
        &self,
        actor: &User,
        target_role: &str,
        req: &AccessRequest,
    ) -> Result<(), AuthzError> {
        if role::can_manage(&actor.role, target_role) {
            return Ok(());
        }

        metrics::counter!(observability::PERMISSION_DENIALS_TOTAL, "reason" => "role_rank")
            .increment(1);
        let detail = format!("role {} cannot manage {}", actor.role, target_role);
        if req.is_write() {
            self.append(denial(actor, req, Some(detail))).await;
        }
        Err(AuthzError::RoleRank {
            actor_role: actor.role.clone(),
            target_role: target_role.to_string(),
        })
    }

    /// Best-effort success entry for a completed write.
    pub async fn record_activity(&self, actor: &User, req: &AccessRequest, detail: Option<String>) {
        let entry = AuditEntry {
            id: Ulid::new(),
            at: now_ms(),
            user_id: actor.id,
            method: req.method.to_string(),
            route: req.route.clone(),
            outcome: AuditOutcome::Success,
            required: req.required.clone(),
            actual: actor.permission_list(),
            detail,
            hidden: false,
        };
        self.append(entry).await;
    }

    async fn append(&self, entry: AuditEntry) {
        let id = entry.id;
        if let Err(e) = self.sink.append(entry).await {
            metrics::counter!(observability::AUDIT_WRITE_FAILURES_TOTAL).increment(1);
            warn!("dropping audit entry {id}: {e}");
        }
    }
}

/// Denial entry. Permission denials carry the request's codes; role-rank
/// denials carry none and explain themselves in `detail`.
fn denial(user: &User, req: &AccessRequest, detail: Option<String>) -> AuditEntry {
    let required = match detail {
        Some(_) => Vec::new(),
        None => req.required.clone(),
    };
    AuditEntry {
        id: Ulid::new(),
        at: now_ms(),
        user_id: user.id,
        method: req.method.to_string(),
        route: req.route.clone(),
        outcome: AuditOutcome::Denied,
        required,
        actual: user.permission_list(),
        detail,
        hidden: false,
    }
}
