use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::engine::{Engine, now_ms};
use crate::observability;

/// Session password check. The password is shared; the login name picks the
/// acting user and must be an active user's ULID or e-mail, or the e-mail of
/// a pending invitation (so the invitee can connect and accept).
pub struct StaydeskAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl StaydeskAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }

    fn admits(&self, login: &str) -> bool {
        self.engine.resolve_login(login).is_some()
            || self.engine.pending_invitation(login, now_ms()).is_some()
    }
}

impl std::fmt::Debug for StaydeskAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaydeskAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for StaydeskAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if !self.admits(user) {
            warn!("rejected login {user:?}");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("login {user:?} is unknown, blocked or deleted"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
