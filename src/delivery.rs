use async_trait::async_trait;
use tracing::info;

use crate::model::Invitation;

#[derive(Debug)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invitation delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Hands a new invitation to whatever tells the invitee about it.
#[async_trait]
pub trait InvitationDelivery: Send + Sync {
    async fn deliver(&self, invitation: &Invitation) -> Result<(), DeliveryError>;
}

/// Writes the invitation to the log. The invitee accepts by logging in with
/// the invited e-mail and running `ACCEPT INVITATION`.
pub struct LogDelivery;

#[async_trait]
impl InvitationDelivery for LogDelivery {
    async fn deliver(&self, invitation: &Invitation) -> Result<(), DeliveryError> {
        info!(
            "invitation {} for <{}> as {} (expires at {})",
            invitation.id,
            invitation.email,
            invitation.role,
            invitation.expires_at
        );
        Ok(())
    }
}
