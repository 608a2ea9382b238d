use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl SyncDb {
    // =========================================================================
    // Groups
    // =========================================================================

    pub(crate) fn map_group_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbGroup> {
        Ok(DbGroup {
            id: row.get(0)?,
            name: row.get(1)?,
            name_key: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    /// Get all groups, ordered by name key for deterministic iteration.
    pub fn get_all_groups(&self) -> Result<Vec<DbGroup>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, name_key, created_at, updated_at
             FROM app_groups ORDER BY name_key",
        )?;
        let rows = stmt.query_map([], Self::map_group_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Get a group by its normalized name key.
    pub fn get_group_by_key(&self, name_key: &str) -> Result<Option<DbGroup>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, name_key, created_at, updated_at
             FROM app_groups WHERE name_key = ?1",
        )?;
        let mut rows = stmt.query_map(params![name_key], Self::map_group_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Create a group from its raw sheet label. Returns the new row.
    pub fn insert_group(&self, name: &str, name_key: &str) -> Result<DbGroup, DbError> {
        let now = Utc::now().to_rfc3339();
        let group = DbGroup {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            name_key: name_key.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.conn.execute(
            "INSERT INTO app_groups (id, name, name_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.id,
                group.name,
                group.name_key,
                group.created_at,
                group.updated_at
            ],
        )?;
        Ok(group)
    }

    /// Refresh a group's display name when the sheet re-cased or re-accented
    /// its label. Identity (the name key) is unchanged.
    pub fn update_group_name(&self, id: &str, name: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE app_groups SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, now, id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_by_key() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Kvutzá Bet", "kvutza bet").unwrap();

        let found = db.get_group_by_key("kvutza bet").unwrap().unwrap();
        assert_eq!(found.id, group.id);
        assert_eq!(found.name, "Kvutzá Bet");

        assert!(db.get_group_by_key("alef").unwrap().is_none());
    }

    #[test]
    fn test_update_group_name_keeps_key() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("KVUTZA BET", "kvutza bet").unwrap();
        db.update_group_name(&group.id, "Kvutzá Bet").unwrap();

        let found = db.get_group_by_key("kvutza bet").unwrap().unwrap();
        assert_eq!(found.name, "Kvutzá Bet");
        assert_eq!(found.name_key, "kvutza bet");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let db = SyncDb::open_in_memory().unwrap();
        db.insert_group("Bet", "bet").unwrap();
        assert!(db.insert_group("BET", "bet").is_err());
    }
}
