use ulid::Ulid;

use crate::model::{Ms, ScopeKey, StayStatus};
use crate::permission::PermissionCode;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    InvalidRange { start: Ms, end: Ms },
    Conflict { scope: ScopeKey, existing: Ulid },
    InvalidTransition { from: StayStatus, to: StayStatus },
    StayCompleted(Ulid),
    UnknownRole(String),
    UnknownPermission(PermissionCode),
    Immutable(Ulid),
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid range: start {start} must be before end {end}")
            }
            EngineError::Conflict { scope, existing } => {
                write!(f, "overlaps {existing} on {scope}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "stay cannot go from {from} to {to}")
            }
            EngineError::StayCompleted(id) => write!(f, "stay {id} is completed and locked"),
            EngineError::UnknownRole(role) => write!(f, "unknown role: {role}"),
            EngineError::UnknownPermission(code) => write!(f, "unknown permission code: {code}"),
            EngineError::Immutable(id) => write!(f, "audit entry {id} cannot be removed"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
