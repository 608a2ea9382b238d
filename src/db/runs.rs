use chrono::Utc;
use rusqlite::params;

use super::*;

impl SyncDb {
    // =========================================================================
    // Sync runs (review → applied | cancelled)
    // =========================================================================

    pub(crate) fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbSyncRun> {
        Ok(DbSyncRun {
            id: row.get(0)?,
            operator_id: row.get(1)?,
            status: row.get(2)?,
            preview_json: row.get(3)?,
            preview_hash: row.get(4)?,
            summary_json: row.get(5)?,
            result_json: row.get(6)?,
            error_note: row.get(7)?,
            created_at: row.get(8)?,
            committed_at: row.get(9)?,
        })
    }

    const RUN_COLUMNS: &'static str = "id, operator_id, status, preview_json, preview_hash,
        summary_json, result_json, error_note, created_at, committed_at";

    /// Insert a new run in `review` state.
    pub fn insert_run(&self, run: &DbSyncRun) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_runs
                (id, operator_id, status, preview_json, preview_hash, summary_json,
                 result_json, error_note, created_at, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.id,
                run.operator_id,
                run.status,
                run.preview_json,
                run.preview_hash,
                run.summary_json,
                run.result_json,
                run.error_note,
                run.created_at,
                run.committed_at
            ],
        )?;
        Ok(())
    }

    /// Get a run by id.
    pub fn get_run(&self, id: &str) -> Result<Option<DbSyncRun>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sync_runs WHERE id = ?1",
            Self::RUN_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id], Self::map_run_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Cancel every still-`review` run of an operator. At most one pending
    /// confirmation may exist per operator; a new preview supersedes the old.
    /// Returns the number of runs cancelled.
    pub fn cancel_review_runs(&self, operator_id: &str) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "UPDATE sync_runs SET status = 'cancelled'
             WHERE operator_id = ?1 AND status = 'review'",
            params![operator_id],
        )?;
        Ok(changed)
    }

    /// Flip a run `review → applied`, recording the execution result.
    ///
    /// Compare-and-swap on status and owner: returns false when no row
    /// matched, meaning the run was already processed (possibly by a
    /// concurrent commit) or belongs to another operator.
    pub fn mark_run_applied(
        &self,
        id: &str,
        operator_id: &str,
        result_json: &str,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE sync_runs
             SET status = 'applied', result_json = ?1, committed_at = ?2, error_note = NULL
             WHERE id = ?3 AND operator_id = ?4 AND status = 'review'",
            params![result_json, now, id, operator_id],
        )?;
        Ok(changed == 1)
    }

    /// Attach an execution error to a run, leaving it in `review`. The
    /// operator must regenerate the preview before retrying.
    pub fn set_run_error(&self, id: &str, note: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE sync_runs SET error_note = ?1 WHERE id = ?2 AND status = 'review'",
            params![note, id],
        )?;
        Ok(())
    }
}
