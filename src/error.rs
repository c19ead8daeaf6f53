use crate::authz::AuthzError;
use crate::engine::EngineError;

/// Everything a back-office operation can fail with, and how the outer
/// layers report it.
#[derive(Debug)]
pub enum BackofficeError {
    Authz(AuthzError),
    Engine(EngineError),
}

impl From<AuthzError> for BackofficeError {
    fn from(e: AuthzError) -> Self {
        BackofficeError::Authz(e)
    }
}

impl From<EngineError> for BackofficeError {
    fn from(e: EngineError) -> Self {
        BackofficeError::Engine(e)
    }
}

impl BackofficeError {
    pub fn http_status(&self) -> u16 {
        match self {
            BackofficeError::Authz(AuthzError::Unauthenticated) => 401,
            BackofficeError::Authz(_) => 403,
            BackofficeError::Engine(e) => match e {
                EngineError::NotFound(_) => 404,
                EngineError::AlreadyExists(_) | EngineError::Conflict { .. } => 409,
                EngineError::InvalidRange { .. }
                | EngineError::UnknownRole(_)
                | EngineError::UnknownPermission(_)
                | EngineError::Validation(_) => 400,
                EngineError::InvalidTransition { .. }
                | EngineError::StayCompleted(_)
                | EngineError::Immutable(_) => 422,
                EngineError::LimitExceeded(_) => 413,
                EngineError::WalError(_) => 500,
            },
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            BackofficeError::Authz(AuthzError::Unauthenticated) => "unauthenticated",
            BackofficeError::Authz(_) => "permission_denied",
            BackofficeError::Engine(e) => match e {
                EngineError::NotFound(_) => "not_found",
                EngineError::AlreadyExists(_) => "already_exists",
                EngineError::InvalidRange { .. } => "invalid_range",
                EngineError::Conflict { .. } => "overlap_conflict",
                EngineError::InvalidTransition { .. } => "invalid_transition",
                EngineError::StayCompleted(_) => "stay_completed",
                EngineError::UnknownRole(_) => "unknown_role",
                EngineError::UnknownPermission(_) => "unknown_permission",
                EngineError::Immutable(_) => "immutable",
                EngineError::Validation(_) => "invalid_input",
                EngineError::LimitExceeded(_) => "limit_exceeded",
                EngineError::WalError(_) => "storage_error",
            },
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            BackofficeError::Authz(AuthzError::Unauthenticated) => "28000",
            BackofficeError::Authz(_) => "42501",
            BackofficeError::Engine(e) => match e {
                EngineError::NotFound(_) => "P0002",
                EngineError::AlreadyExists(_) => "23505",
                EngineError::InvalidRange { .. } => "22023",
                EngineError::Conflict { .. } => "23P01",
                EngineError::InvalidTransition { .. }
                | EngineError::StayCompleted(_)
                | EngineError::Immutable(_) => "55000",
                EngineError::UnknownRole(_)
                | EngineError::UnknownPermission(_)
                | EngineError::Validation(_) => "22000",
                EngineError::LimitExceeded(_) => "54000",
                EngineError::WalError(_) => "58030",
            },
        }
    }
}

impl std::fmt::Display for BackofficeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackofficeError::Authz(e) => e.fmt(f),
            BackofficeError::Engine(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for BackofficeError {}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::model::ScopeKey;

    #[test]
    fn core_outcomes_map_to_stable_codes() {
        let denied: BackofficeError = AuthzError::Forbidden {
            required: vec![8004],
            actual: vec![8001],
        }
        .into();
        assert_eq!((denied.http_status(), denied.sqlstate(), denied.code()), (403, "42501", "permission_denied"));

        let conflict: BackofficeError = EngineError::Conflict {
            scope: ScopeKey::Room(Ulid::new()),
            existing: Ulid::new(),
        }
        .into();
        assert_eq!((conflict.http_status(), conflict.sqlstate(), conflict.code()), (409, "23P01", "overlap_conflict"));

        let range: BackofficeError = EngineError::InvalidRange { start: 5, end: 5 }.into();
        assert_eq!((range.http_status(), range.sqlstate(), range.code()), (400, "22023", "invalid_range"));
    }

    #[test]
    fn role_rank_denial_is_a_permission_denial() {
        let e: BackofficeError = AuthzError::RoleRank {
            actor_role: "zoneAgent".into(),
            target_role: "cityAgent".into(),
        }
        .into();
        assert_eq!(e.http_status(), 403);
        assert_eq!(e.sqlstate(), "42501");
    }

    #[test]
    fn unauthenticated_is_distinct() {
        let e: BackofficeError = AuthzError::Unauthenticated.into();
        assert_eq!(e.http_status(), 401);
        assert_eq!(e.sqlstate(), "28000");
    }
}
