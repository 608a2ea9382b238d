use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl SyncDb {
    // =========================================================================
    // Roster rows
    // =========================================================================

    pub(crate) fn map_roster_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbRosterRow> {
        Ok(DbRosterRow {
            id: row.get(0)?,
            group_id: row.get(1)?,
            project_id: row.get(2)?,
            full_name: row.get(3)?,
            name_key: row.get(4)?,
            mother_phone: row.get(5)?,
            father_phone: row.get(6)?,
            member_number: row.get(7)?,
            active: row.get::<_, i32>(8)? != 0,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    const ROSTER_COLUMNS: &'static str = "id, group_id, project_id, full_name, name_key,
        mother_phone, father_phone, member_number, active, created_at, updated_at";

    /// All roster rows (active and inactive) grouped by group id, each
    /// group's rows ordered by name key.
    pub fn get_roster_by_group(&self) -> Result<HashMap<String, Vec<DbRosterRow>>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM roster ORDER BY group_id, name_key",
            Self::ROSTER_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_roster_row)?;
        let mut map: HashMap<String, Vec<DbRosterRow>> = HashMap::new();
        for row in rows {
            let entry = row?;
            map.entry(entry.group_id.clone()).or_default().push(entry);
        }
        Ok(map)
    }

    /// Roster rows for one group, ordered by name key.
    pub fn get_roster_for_group(&self, group_id: &str) -> Result<Vec<DbRosterRow>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM roster WHERE group_id = ?1 ORDER BY name_key",
            Self::ROSTER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![group_id], Self::map_roster_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert a roster row, or reactivate/refresh the existing row for the
    /// same (group, full-name) pair. Idempotent.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_roster_row(
        &self,
        group_id: &str,
        project_id: Option<&str>,
        full_name: &str,
        name_key: &str,
        mother_phone: Option<&str>,
        father_phone: Option<&str>,
        member_number: Option<&str>,
    ) -> Result<String, DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO roster
                (id, group_id, project_id, full_name, name_key, mother_phone, father_phone,
                 member_number, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)
             ON CONFLICT(group_id, name_key) DO UPDATE SET
                project_id = excluded.project_id,
                full_name = excluded.full_name,
                mother_phone = excluded.mother_phone,
                father_phone = excluded.father_phone,
                member_number = excluded.member_number,
                active = 1,
                updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                group_id,
                project_id,
                full_name,
                name_key,
                mother_phone,
                father_phone,
                member_number,
                now
            ],
        )?;
        let id: String = self.conn.query_row(
            "SELECT id FROM roster WHERE group_id = ?1 AND name_key = ?2",
            params![group_id, name_key],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Update a single whitelisted field on a roster row.
    pub fn update_roster_field(&self, id: &str, field: &str, value: Option<&str>) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let sql = match field {
            "full_name" => "UPDATE roster SET full_name = ?1, updated_at = ?3 WHERE id = ?2",
            "mother_phone" => "UPDATE roster SET mother_phone = ?1, updated_at = ?3 WHERE id = ?2",
            "father_phone" => "UPDATE roster SET father_phone = ?1, updated_at = ?3 WHERE id = ?2",
            "member_number" => "UPDATE roster SET member_number = ?1, updated_at = ?3 WHERE id = ?2",
            _ => {
                return Err(DbError::Sqlite(rusqlite::Error::InvalidParameterName(
                    format!("Field '{}' is not updatable", field),
                )))
            }
        };
        self.conn.execute(sql, params![value, id, now])?;
        Ok(())
    }

    /// Reactivate a roster row.
    pub fn reactivate_roster_row(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE roster SET active = 1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Deactivate one roster row. The row is retained for history.
    pub fn deactivate_roster_row(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE roster SET active = 0, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Deactivate every active roster row of a group (orphan cleanup).
    /// Returns the number of rows deactivated.
    pub fn deactivate_roster_for_group(&self, group_id: &str) -> Result<usize, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE roster SET active = 0, updated_at = ?1
             WHERE group_id = ?2 AND active = 1",
            params![now, group_id],
        )?;
        Ok(changed)
    }

    // =========================================================================
    // Extra-group side table (optional capability)
    // =========================================================================

    /// Map roster row id → set of additional group ids.
    ///
    /// Callers must have probed `has_roster_extras()` first; this fails if the
    /// table is absent.
    pub fn get_roster_extras(&self) -> Result<HashMap<String, BTreeSet<String>>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT roster_id, group_id FROM roster_extra_groups")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            let (roster_id, group_id) = row?;
            map.entry(roster_id).or_default().insert(group_id);
        }
        Ok(map)
    }

    /// Link a roster row to an additional group.
    pub fn add_roster_extra(&self, roster_id: &str, group_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO roster_extra_groups (roster_id, group_id) VALUES (?1, ?2)",
            params![roster_id, group_id],
        )?;
        Ok(())
    }

    /// Remove a roster row's link to an additional group.
    pub fn remove_roster_extra(&self, roster_id: &str, group_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM roster_extra_groups WHERE roster_id = ?1 AND group_id = ?2",
            params![roster_id, group_id],
        )?;
        Ok(())
    }
}
