//! Error types for the sheet reconciliation engine.
//!
//! Errors are classified by what the caller can do about them:
//! - Transport: the spreadsheet or its backing service is unreachable
//! - AccessDenied: the operator lacks the required role (403-class)
//! - RunNotFound / NotRunOwner / AlreadyProcessed: run-store state violations
//!
//! Data-quality problems (unknown project names, duplicate sheet rows, missing
//! optional fields) are never errors — they surface as preview content.

use thiserror::Error;

use crate::db::DbError;

/// Errors produced by preview generation and commit execution.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("spreadsheet transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("operator '{0}' is not authorized to run a sheet sync")]
    AccessDenied(String),

    #[error("sync run not found: {0}")]
    RunNotFound(String),

    #[error("sync run {0} belongs to another operator")]
    NotRunOwner(String),

    #[error("sync run {0} was already processed")]
    AlreadyProcessed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// True for state violations that map to a conflict-class response
    /// (committing an already-processed run, or someone else's run).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SyncError::AlreadyProcessed(_) | SyncError::NotRunOwner(_)
        )
    }

    /// True when the requested run does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::RunNotFound(_))
    }

    /// True when the operator failed the authorization gate.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, SyncError::AccessDenied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(SyncError::AlreadyProcessed("r1".into()).is_conflict());
        assert!(SyncError::NotRunOwner("r1".into()).is_conflict());
        assert!(!SyncError::RunNotFound("r1".into()).is_conflict());
        assert!(!SyncError::Transport("down".into()).is_conflict());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(SyncError::RunNotFound("r1".into()).is_not_found());
        assert!(!SyncError::AccessDenied("op".into()).is_not_found());
    }
}
