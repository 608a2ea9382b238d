//! One coherent read of everything the diff engine compares against.

use std::collections::{BTreeSet, HashMap};

use super::*;

/// Current relational state, loaded once per preview/commit call.
///
/// `roster_extras` is `None` when the extras side table is absent from the
/// schema (capability probed once, never inferred from errors).
pub struct StoreSnapshot {
    pub groups: Vec<DbGroup>,
    pub projects: Vec<DbProject>,
    /// group id → project id for every association row.
    pub group_project: HashMap<String, String>,
    pub members_by_group: HashMap<String, Vec<DbGroupMember>>,
    pub roster_by_group: HashMap<String, Vec<DbRosterRow>>,
    pub roster_extras: Option<HashMap<String, BTreeSet<String>>>,
    pub role_grants: Vec<DbRoleGrant>,
    /// grant id → set of linked project ids.
    pub coordinator_links: HashMap<String, BTreeSet<String>>,
}

impl StoreSnapshot {
    /// Read the full snapshot. Storage failures propagate unchanged —
    /// no partial snapshot is ever produced.
    pub fn load(db: &SyncDb) -> Result<Self, DbError> {
        let roster_extras = if db.has_roster_extras()? {
            Some(db.get_roster_extras()?)
        } else {
            log::warn!("roster_extra_groups table absent; extra-group sync disabled");
            None
        };

        Ok(Self {
            groups: db.get_all_groups()?,
            projects: db.get_all_projects()?,
            group_project: db.get_group_project_map()?,
            members_by_group: db.get_members_by_group()?,
            roster_by_group: db.get_roster_by_group()?,
            roster_extras,
            role_grants: db.get_all_role_grants()?,
            coordinator_links: db.get_coordinator_links()?,
        })
    }

    /// Look up a group by normalized name key.
    pub fn group_by_key(&self, name_key: &str) -> Option<&DbGroup> {
        self.groups.iter().find(|g| g.name_key == name_key)
    }

    /// Look up a project by normalized name key.
    pub fn project_by_key(&self, name_key: &str) -> Option<&DbProject> {
        self.projects.iter().find(|p| p.name_key == name_key)
    }

    /// Group display name by id (used when reporting stored extra groups).
    pub fn group_name_by_id(&self, id: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.name.as_str())
    }

    /// Project display name by id.
    pub fn project_name_by_id(&self, id: &str) -> Option<&str> {
        self.projects
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
    }

    /// The project historically linked to a group: association row first,
    /// then the legacy single-group column.
    pub fn historical_project_for_group(&self, group_id: &str) -> Option<&DbProject> {
        if let Some(project_id) = self.group_project.get(group_id) {
            return self.projects.iter().find(|p| &p.id == project_id);
        }
        self.projects
            .iter()
            .find(|p| p.legacy_group_id.as_deref() == Some(group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_empty_store() {
        let db = SyncDb::open_in_memory().unwrap();
        let snapshot = StoreSnapshot::load(&db).unwrap();
        assert!(snapshot.groups.is_empty());
        assert!(snapshot.roster_extras.is_some(), "capability present");
    }

    #[test]
    fn test_load_degrades_without_extras_table() {
        let db = SyncDb::open_in_memory().unwrap();
        db.conn_ref()
            .execute_batch("DROP TABLE roster_extra_groups;")
            .unwrap();
        let snapshot = StoreSnapshot::load(&db).unwrap();
        assert!(snapshot.roster_extras.is_none());
    }

    #[test]
    fn test_historical_project_prefers_association() {
        let db = SyncDb::open_in_memory().unwrap();
        let group = db.insert_group("Bet", "bet").unwrap();
        let norte = db.insert_project("Norte", "norte").unwrap();
        let sur = db.insert_project("Sur", "sur").unwrap();

        // Legacy points at Sur, association at Norte — association wins.
        db.conn_ref()
            .execute(
                "UPDATE app_projects SET legacy_group_id = ?1 WHERE id = ?2",
                rusqlite::params![group.id, sur.id],
            )
            .unwrap();
        db.set_group_project(&group.id, &norte.id).unwrap();

        let snapshot = StoreSnapshot::load(&db).unwrap();
        let project = snapshot.historical_project_for_group(&group.id).unwrap();
        assert_eq!(project.name, "Norte");
    }
}
