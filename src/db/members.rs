use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::*;

impl SyncDb {
    // =========================================================================
    // Person profiles
    // =========================================================================

    /// Insert or refresh the person profile keyed by normalized email.
    pub fn upsert_person_profile(
        &self,
        email: &str,
        email_key: &str,
        display_name: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO person_profiles (email_key, email, display_name, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email_key) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                updated_at = excluded.updated_at",
            params![email_key, email, display_name, now],
        )?;
        Ok(())
    }

    /// Get a person profile by normalized email.
    pub fn get_person_profile(&self, email_key: &str) -> Result<Option<DbPersonProfile>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT email_key, email, display_name, updated_at
             FROM person_profiles WHERE email_key = ?1",
        )?;
        let mut rows = stmt.query_map(params![email_key], |row| {
            Ok(DbPersonProfile {
                email_key: row.get(0)?,
                email: row.get(1)?,
                display_name: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Group membership
    // =========================================================================

    pub(crate) fn map_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbGroupMember> {
        Ok(DbGroupMember {
            id: row.get(0)?,
            group_id: row.get(1)?,
            email: row.get(2)?,
            email_key: row.get(3)?,
            display_name: row.get(4)?,
            role: row.get(5)?,
            active: row.get::<_, i32>(6)? != 0,
            invited: row.get::<_, i32>(7)? != 0,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    const MEMBER_COLUMNS: &'static str = "id, group_id, email, email_key, display_name, role,
        active, invited, created_at, updated_at";

    /// All membership rows (active and inactive) grouped by group id,
    /// each group's rows ordered by email key.
    pub fn get_members_by_group(&self) -> Result<HashMap<String, Vec<DbGroupMember>>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM group_members ORDER BY group_id, email_key",
            Self::MEMBER_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_member_row)?;
        let mut map: HashMap<String, Vec<DbGroupMember>> = HashMap::new();
        for row in rows {
            let member = row?;
            map.entry(member.group_id.clone()).or_default().push(member);
        }
        Ok(map)
    }

    /// Membership rows for one group, ordered by email key.
    pub fn get_members_for_group(&self, group_id: &str) -> Result<Vec<DbGroupMember>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM group_members WHERE group_id = ?1 ORDER BY email_key",
            Self::MEMBER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![group_id], Self::map_member_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert a membership row, or reactivate/refresh the existing row for the
    /// same (group, email) pair. Idempotent by design — replaying a commit
    /// converges on the same state.
    pub fn upsert_member(
        &self,
        group_id: &str,
        email: &str,
        email_key: &str,
        display_name: &str,
        role: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO group_members
                (id, group_id, email, email_key, display_name, role, active, invited,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, ?7, ?7)
             ON CONFLICT(group_id, email_key) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                active = 1,
                updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                group_id,
                email,
                email_key,
                display_name,
                role,
                now
            ],
        )?;
        Ok(())
    }

    /// Update a membership row's display name and reactivate it.
    pub fn update_member(
        &self,
        id: &str,
        display_name: Option<&str>,
        reactivate: bool,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        if let Some(name) = display_name {
            self.conn.execute(
                "UPDATE group_members SET display_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )?;
        }
        if reactivate {
            self.conn.execute(
                "UPDATE group_members SET active = 1, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(())
    }

    /// Deactivate one membership row. The row is retained for history.
    pub fn deactivate_member(&self, id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE group_members SET active = 0, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Deactivate every active membership row of a group (orphan cleanup).
    /// Returns the number of rows deactivated.
    pub fn deactivate_members_for_group(&self, group_id: &str) -> Result<usize, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE group_members SET active = 0, updated_at = ?1
             WHERE group_id = ?2 AND active = 1",
            params![now, group_id],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_member_is_idempotent_and_reactivates() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Bet", "bet").unwrap();

        db.upsert_member(&group.id, "Dani@X.com", "dani@x.com", "Dani", "staff")
            .unwrap();
        let members = db.get_members_for_group(&group.id).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].active);
        let original_id = members[0].id.clone();

        db.deactivate_member(&original_id).unwrap();
        db.upsert_member(&group.id, "dani@x.com", "dani@x.com", "Daniel", "staff")
            .unwrap();

        let members = db.get_members_for_group(&group.id).unwrap();
        assert_eq!(members.len(), 1, "same natural key, same row");
        assert!(members[0].active, "upsert reactivates");
        assert_eq!(members[0].display_name, "Daniel");
        assert_eq!(members[0].id, original_id);
    }

    #[test]
    fn test_deactivate_members_for_group_counts_active_only() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Bet", "bet").unwrap();
        db.upsert_member(&group.id, "a@x.com", "a@x.com", "A", "staff")
            .unwrap();
        db.upsert_member(&group.id, "b@x.com", "b@x.com", "B", "staff")
            .unwrap();
        let members = db.get_members_for_group(&group.id).unwrap();
        db.deactivate_member(&members[0].id).unwrap();

        let changed = db.deactivate_members_for_group(&group.id).unwrap();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_person_profile_upsert_refreshes() {
        let db = SyncDb::open_in_memory().unwrap();
        db.upsert_person_profile("Ana@X.com", "ana@x.com", "Ana")
            .unwrap();
        db.upsert_person_profile("ana@x.com", "ana@x.com", "Ana Pérez")
            .unwrap();

        let profile = db.get_person_profile("ana@x.com").unwrap().unwrap();
        assert_eq!(profile.display_name, "Ana Pérez");
    }
}
