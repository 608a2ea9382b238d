//! Top-level operations: preview runs, confirmed commits, and the one-shot
//! administrative apply.
//!
//! The two-phase protocol: `create_run` persists a preview under a run id for
//! the operator to review; `commit_run` validates the stored run (existence,
//! ownership, state) and then recomputes the whole plan against the current
//! spreadsheet and storage before writing anything. The stored preview is the
//! human-review artifact, never the write source — state may have drifted
//! between preview and confirmation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commit::{execute_preview, SyncOutcome};
use crate::db::{DbSyncRun, StoreSnapshot, SyncDb};
use crate::error::SyncError;
use crate::normalize::normalize_email;
use crate::preview::{build_preview, SyncPreview};
use crate::sheet::{load_snapshot, SheetConfig, SheetSnapshot, SheetSource};

/// Roles the operator holds, as resolved by the authorization gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleContext {
    pub operator_id: String,
    pub roles: Vec<String>,
}

/// Pre-condition capability: "caller is authorized". Fails with
/// `SyncError::AccessDenied`.
pub trait AuthorizationGate {
    fn ensure_authorized(&self, operator_id: &str) -> Result<RoleContext, SyncError>;
}

/// Gate backed by the `app_roles` table: sheet syncs require an active
/// director or admin grant.
pub struct DbAuthGate<'a> {
    db: &'a SyncDb,
}

impl<'a> DbAuthGate<'a> {
    pub fn new(db: &'a SyncDb) -> Self {
        Self { db }
    }
}

impl AuthorizationGate for DbAuthGate<'_> {
    fn ensure_authorized(&self, operator_id: &str) -> Result<RoleContext, SyncError> {
        let email_key = normalize_email(operator_id);
        let roles = self.db.get_active_roles(&email_key)?;
        if roles.iter().any(|r| r == "director" || r == "admin") {
            Ok(RoleContext {
                operator_id: operator_id.to_string(),
                roles,
            })
        } else {
            Err(SyncError::AccessDenied(operator_id.to_string()))
        }
    }
}

/// A persisted preview awaiting confirmation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    pub run_id: String,
    pub preview: SyncPreview,
}

/// What a commit (or direct apply) returns: the plan that was executed and
/// the tally of writes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub preview: SyncPreview,
    pub result: SyncOutcome,
}

/// Compute a preview and persist it as a new `review` run for the operator.
///
/// Any prior still-`review` run of the same operator is cancelled first —
/// at most one pending confirmation exists per operator, so a stale plan can
/// never be committed by accident.
pub fn create_run(
    db: &SyncDb,
    source: &dyn SheetSource,
    auth: &dyn AuthorizationGate,
    config: &SheetConfig,
    operator_id: &str,
) -> Result<RunHandle, SyncError> {
    auth.ensure_authorized(operator_id)?;

    let sheet = load_snapshot(source, config)?;
    let store = StoreSnapshot::load(db)?;
    let preview = build_preview(&store, &sheet);

    let cancelled = db.cancel_review_runs(operator_id)?;
    if cancelled > 0 {
        log::info!(
            "superseded {} pending run(s) for operator {}",
            cancelled,
            operator_id
        );
    }

    let run = DbSyncRun {
        id: Uuid::new_v4().to_string(),
        operator_id: operator_id.to_string(),
        status: "review".to_string(),
        preview_json: serde_json::to_string(&preview)?,
        preview_hash: preview.content_hash(),
        summary_json: serde_json::to_string(&preview.summary)?,
        result_json: None,
        error_note: None,
        created_at: Utc::now().to_rfc3339(),
        committed_at: None,
    };
    db.insert_run(&run)?;

    Ok(RunHandle {
        run_id: run.id,
        preview,
    })
}

/// Commit a previously created run.
///
/// Fails with `RunNotFound`, `NotRunOwner` or `AlreadyProcessed` before
/// touching storage. The plan is recomputed fresh; on execution failure the
/// run stays in `review` with an error note and must be regenerated — there
/// is no automatic retry.
pub fn commit_run(
    db: &SyncDb,
    source: &dyn SheetSource,
    auth: &dyn AuthorizationGate,
    config: &SheetConfig,
    run_id: &str,
    operator_id: &str,
) -> Result<CommitReport, SyncError> {
    auth.ensure_authorized(operator_id)?;

    let run = db
        .get_run(run_id)?
        .ok_or_else(|| SyncError::RunNotFound(run_id.to_string()))?;
    if run.operator_id != operator_id {
        return Err(SyncError::NotRunOwner(run_id.to_string()));
    }
    if run.status != "review" {
        return Err(SyncError::AlreadyProcessed(run_id.to_string()));
    }

    let sheet = load_snapshot(source, config)?;
    let store = StoreSnapshot::load(db)?;
    let preview = build_preview(&store, &sheet);
    if preview.content_hash() != run.preview_hash {
        log::info!(
            "run {}: state drifted since preview; committing the recomputed plan",
            run_id
        );
    }

    let result = match execute_preview(db, &preview) {
        Ok(result) => result,
        Err(e) => {
            let _ = db.set_run_error(run_id, &e.to_string());
            return Err(e);
        }
    };

    let applied = db.mark_run_applied(run_id, operator_id, &serde_json::to_string(&result)?)?;
    if !applied {
        // A concurrent commit won the status CAS after our validation read.
        return Err(SyncError::AlreadyProcessed(run_id.to_string()));
    }

    Ok(CommitReport { preview, result })
}

/// One-shot programmatic apply, bypassing the run store. The caller is
/// responsible for authorization.
pub fn apply_direct(db: &SyncDb, sheet: &SheetSnapshot) -> Result<CommitReport, SyncError> {
    let store = StoreSnapshot::load(db)?;
    let preview = build_preview(&store, sheet);
    let result = execute_preview(db, &preview)?;
    Ok(CommitReport { preview, result })
}
