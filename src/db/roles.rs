use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl SyncDb {
    // =========================================================================
    // Role grants
    // =========================================================================

    pub(crate) fn map_role_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbRoleGrant> {
        Ok(DbRoleGrant {
            id: row.get(0)?,
            email: row.get(1)?,
            email_key: row.get(2)?,
            role: row.get(3)?,
            display_name: row.get(4)?,
            active: row.get::<_, i32>(5)? != 0,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    const ROLE_COLUMNS: &'static str =
        "id, email, email_key, role, display_name, active, created_at, updated_at";

    /// All role grants (active and inactive), ordered by role then email key.
    pub fn get_all_role_grants(&self) -> Result<Vec<DbRoleGrant>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM app_roles ORDER BY role, email_key",
            Self::ROLE_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_role_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Get a grant by (normalized email, role).
    pub fn get_role_grant(&self, email_key: &str, role: &str) -> Result<Option<DbRoleGrant>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM app_roles WHERE email_key = ?1 AND role = ?2",
            Self::ROLE_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![email_key, role], Self::map_role_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Insert a grant, or reactivate/refresh the existing (email, role) row.
    /// Returns the grant id.
    pub fn upsert_role_grant(
        &self,
        email: &str,
        email_key: &str,
        role: &str,
        display_name: &str,
    ) -> Result<String, DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO app_roles
                (id, email, email_key, role, display_name, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(email_key, role) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                active = 1,
                updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                email,
                email_key,
                role,
                display_name,
                now
            ],
        )?;
        let id: String = self.conn.query_row(
            "SELECT id FROM app_roles WHERE email_key = ?1 AND role = ?2",
            params![email_key, role],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Deactivate a grant. The row is retained; a later sheet can reactivate it.
    pub fn deactivate_role_grant(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE app_roles SET active = 0, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Active roles held by an email, ordered for determinism.
    pub fn get_active_roles(&self, email_key: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT role FROM app_roles WHERE email_key = ?1 AND active = 1 ORDER BY role",
        )?;
        let rows = stmt.query_map(params![email_key], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Coordinator↔project links
    // =========================================================================

    /// Map grant id → set of linked project ids.
    pub fn get_coordinator_links(&self) -> Result<HashMap<String, BTreeSet<String>>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT role_id, project_id FROM coordinator_projects")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            let (role_id, project_id) = row?;
            map.entry(role_id).or_default().insert(project_id);
        }
        Ok(map)
    }

    /// Link a coordinator grant to a project.
    pub fn add_coordinator_link(&self, role_id: &str, project_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO coordinator_projects (role_id, project_id) VALUES (?1, ?2)",
            params![role_id, project_id],
        )?;
        Ok(())
    }

    /// Remove a coordinator grant's link to a project.
    pub fn remove_coordinator_link(&self, role_id: &str, project_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM coordinator_projects WHERE role_id = ?1 AND project_id = ?2",
            params![role_id, project_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_role_grant_reactivates_same_row() {
        let db = SyncDb::open_in_memory().unwrap();
        let id1 = db
            .upsert_role_grant("Ana@X.com", "ana@x.com", "coordinator", "Ana")
            .unwrap();
        db.deactivate_role_grant(&id1).unwrap();

        let id2 = db
            .upsert_role_grant("ana@x.com", "ana@x.com", "coordinator", "Ana Pérez")
            .unwrap();
        assert_eq!(id1, id2);

        let grant = db.get_role_grant("ana@x.com", "coordinator").unwrap().unwrap();
        assert!(grant.active);
        assert_eq!(grant.display_name, "Ana Pérez");
    }

    #[test]
    fn test_grant_unique_per_email_and_role() {
        let db = SyncDb::open_in_memory().unwrap();
        let coord = db
            .upsert_role_grant("ana@x.com", "ana@x.com", "coordinator", "Ana")
            .unwrap();
        let admin = db
            .upsert_role_grant("ana@x.com", "ana@x.com", "admin", "Ana")
            .unwrap();
        assert_ne!(coord, admin, "one grant per (email, role)");
    }

    #[test]
    fn test_active_roles_exclude_deactivated() {
        let db = SyncDb::open_in_memory().unwrap();
        let id = db
            .upsert_role_grant("dir@x.com", "dir@x.com", "director", "Dir")
            .unwrap();
        assert_eq!(db.get_active_roles("dir@x.com").unwrap(), vec!["director"]);

        db.deactivate_role_grant(&id).unwrap();
        assert!(db.get_active_roles("dir@x.com").unwrap().is_empty());
    }

    #[test]
    fn test_coordinator_links_round_trip() {
        let db = SyncDb::open_in_memory().unwrap();
        let role_id = db
            .upsert_role_grant("ana@x.com", "ana@x.com", "coordinator", "Ana")
            .unwrap();
        let project = db.insert_project("Norte", "norte").unwrap();

        db.add_coordinator_link(&role_id, &project.id).unwrap();
        db.add_coordinator_link(&role_id, &project.id).unwrap();
        let links = db.get_coordinator_links().unwrap();
        assert_eq!(links.get(&role_id).unwrap().len(), 1);

        db.remove_coordinator_link(&role_id, &project.id).unwrap();
        let links = db.get_coordinator_links().unwrap();
        assert!(links.get(&role_id).is_none());
    }
}
