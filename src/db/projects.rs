use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl SyncDb {
    // =========================================================================
    // Projects and the group↔project association
    // =========================================================================

    pub(crate) fn map_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbProject> {
        Ok(DbProject {
            id: row.get(0)?,
            name: row.get(1)?,
            name_key: row.get(2)?,
            legacy_group_id: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    /// Get all projects, ordered by name key.
    pub fn get_all_projects(&self) -> Result<Vec<DbProject>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, name_key, legacy_group_id, created_at, updated_at
             FROM app_projects ORDER BY name_key",
        )?;
        let rows = stmt.query_map([], Self::map_project_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Get a project by its normalized name key.
    pub fn get_project_by_key(&self, name_key: &str) -> Result<Option<DbProject>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, name_key, legacy_group_id, created_at, updated_at
             FROM app_projects WHERE name_key = ?1",
        )?;
        let mut rows = stmt.query_map(params![name_key], Self::map_project_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Create a project from its raw sheet label.
    pub fn insert_project(&self, name: &str, name_key: &str) -> Result<DbProject, DbError> {
        let now = Utc::now().to_rfc3339();
        let project = DbProject {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            name_key: name_key.to_string(),
            legacy_group_id: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.conn.execute(
            "INSERT INTO app_projects (id, name, name_key, legacy_group_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                project.id,
                project.name,
                project.name_key,
                project.created_at,
                project.updated_at
            ],
        )?;
        Ok(project)
    }

    /// Refresh a project's display name. Identity (the name key) is unchanged.
    pub fn update_project_name(&self, id: &str, name: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE app_projects SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, now, id],
        )?;
        Ok(())
    }

    /// Link a group to a project, replacing any previous project for the
    /// group. A group belongs to exactly one project at a time. The project's
    /// legacy single-group linkage is nulled once the association exists.
    pub fn set_group_project(&self, group_id: &str, project_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM group_projects WHERE group_id = ?1 AND project_id != ?2",
            params![group_id, project_id],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO group_projects (group_id, project_id) VALUES (?1, ?2)",
            params![group_id, project_id],
        )?;
        self.conn.execute(
            "UPDATE app_projects SET legacy_group_id = NULL
             WHERE id = ?1 AND legacy_group_id IS NOT NULL",
            params![project_id],
        )?;
        Ok(())
    }

    /// Map group id → project id for every association row.
    pub fn get_group_project_map(&self) -> Result<HashMap<String, String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id, project_id FROM group_projects")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (group_id, project_id) = row?;
            map.insert(group_id, project_id);
        }
        Ok(map)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_group_project_replaces_previous() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Bet", "bet").unwrap();
        let norte = db.insert_project("Norte", "norte").unwrap();
        let sur = db.insert_project("Sur", "sur").unwrap();

        db.set_group_project(&group.id, &norte.id).unwrap();
        db.set_group_project(&group.id, &sur.id).unwrap();

        let map = db.get_group_project_map().unwrap();
        assert_eq!(map.get(&group.id), Some(&sur.id));
        assert_eq!(map.len(), 1, "group belongs to exactly one project");
    }

    #[test]
    fn test_association_nulls_legacy_linkage() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Bet", "bet").unwrap();
        let project = db.insert_project("Norte", "norte").unwrap();
        db.conn_ref()
            .execute(
                "UPDATE app_projects SET legacy_group_id = ?1 WHERE id = ?2",
                params![group.id, project.id],
            )
            .unwrap();

        db.set_group_project(&group.id, &project.id).unwrap();

        let stored = db.get_project_by_key("norte").unwrap().unwrap();
        assert!(stored.legacy_group_id.is_none());
    }

    #[test]
    fn test_set_group_project_idempotent() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Bet", "bet").unwrap();
        let project = db.insert_project("Norte", "norte").unwrap();

        db.set_group_project(&group.id, &project.id).unwrap();
        db.set_group_project(&group.id, &project.id).unwrap();

        let map = db.get_group_project_map().unwrap();
        assert_eq!(map.len(), 1);
    }
}
