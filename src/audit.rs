//! Audit sink: where denial and activity entries are written.

use async_trait::async_trait;

use crate::engine::{Engine, EngineError};
use crate::model::AuditEntry;

#[derive(Debug)]
pub struct AuditError(pub String);

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "audit write failed: {}", self.0)
    }
}

impl std::error::Error for AuditError {}

impl From<EngineError> for AuditError {
    fn from(e: EngineError) -> Self {
        AuditError(e.to_string())
    }
}

/// Append-only destination for audit entries. Callers treat writes as
/// fire-and-forget: a failure is logged and counted, never returned to the
/// request that caused it.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

#[async_trait]
impl AuditSink for Engine {
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.record_audit(entry).await.map_err(AuditError::from)
    }
}
