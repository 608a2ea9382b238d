//! Replays a computed preview against the relational store.
//!
//! Each group is applied inside its own transaction, in the preview's sorted
//! order. A failure in any group aborts the whole commit — already-applied
//! groups are left in place and a replay converges on the same state, since
//! every write is an upsert or a flag flip. The orphan pass and the role pass
//! run after all groups so membership changes land first.

use serde::{Deserialize, Serialize};

use crate::db::{DbError, SyncDb};
use crate::diff::{GroupPlan, OrphanGroup};
use crate::error::SyncError;
use crate::normalize::{normalize_email, normalize_key};
use crate::preview::SyncPreview;

/// Tally of everything a commit actually wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub groups_processed: usize,
    pub groups_created: usize,
    pub projects_created: usize,
    pub members_inserted: usize,
    pub members_updated: usize,
    pub members_deactivated: usize,
    pub roster_inserted: usize,
    pub roster_updated: usize,
    pub roster_deactivated: usize,
    pub orphan_groups_processed: usize,
    pub orphan_rows_deactivated: usize,
    pub roles_upserted: usize,
    pub roles_deactivated: usize,
    pub links_added: usize,
    pub links_removed: usize,
}

/// Apply the preview's change set. The preview must have been computed
/// against this database's current state.
pub fn execute_preview(db: &SyncDb, preview: &SyncPreview) -> Result<SyncOutcome, SyncError> {
    let mut outcome = SyncOutcome::default();
    let extras_enabled = db.has_roster_extras()?;

    for plan in &preview.groups {
        db.with_transaction(|db| apply_group(db, plan, extras_enabled, &mut outcome))?;
        outcome.groups_processed += 1;
    }

    for orphan in &preview.orphans {
        db.with_transaction(|db| apply_orphan(db, orphan, &mut outcome))?;
    }

    db.with_transaction(|db| apply_roles(db, preview, &mut outcome))?;

    log::info!(
        "sheet sync applied: {} groups, {} orphans, {} role upserts",
        outcome.groups_processed,
        outcome.orphan_groups_processed,
        outcome.roles_upserted,
    );
    Ok(outcome)
}

fn apply_group(
    db: &SyncDb,
    plan: &GroupPlan,
    extras_enabled: bool,
    outcome: &mut SyncOutcome,
) -> Result<(), DbError> {
    // Resolve the group by key rather than trusting the plan's id — a replay
    // after a partial commit must find the row the first attempt created.
    let group = match db.get_group_by_key(&plan.group_key)? {
        Some(existing) => {
            if existing.name != plan.group_name {
                db.update_group_name(&existing.id, &plan.group_name)?;
            }
            existing
        }
        None => {
            outcome.groups_created += 1;
            db.insert_group(&plan.group_name, &plan.group_key)?
        }
    };

    let project_id = match &plan.project_name {
        None => None,
        Some(project_name) => {
            let project_key = normalize_key(project_name);
            let project = match db.get_project_by_key(&project_key)? {
                Some(existing) => {
                    if existing.name != *project_name {
                        db.update_project_name(&existing.id, project_name)?;
                    }
                    existing
                }
                None => {
                    outcome.projects_created += 1;
                    db.insert_project(project_name, &project_key)?
                }
            };
            db.set_group_project(&group.id, &project.id)?;
            Some(project.id)
        }
    };

    // Member sync: person profile first, then the membership row.
    for entry in &plan.members.inserts {
        db.upsert_person_profile(&entry.email, &entry.email_key, &entry.display_name)?;
        db.upsert_member(
            &group.id,
            &entry.email,
            &entry.email_key,
            &entry.display_name,
            "staff",
        )?;
        outcome.members_inserted += 1;
    }
    for update in &plan.members.updates {
        let new_name = update.display_name.as_ref().and_then(|c| c.after.as_deref());
        if let Some(name) = new_name {
            db.upsert_person_profile(&update.email, &normalize_email(&update.email), name)?;
        }
        db.update_member(&update.id, new_name, update.reactivate)?;
        outcome.members_updated += 1;
    }
    for removal in &plan.members.deactivations {
        db.deactivate_member(&removal.id)?;
        outcome.members_deactivated += 1;
    }

    // Roster sync, writing through the field-level diff.
    for entry in &plan.roster.inserts {
        let roster_id = db.upsert_roster_row(
            &group.id,
            project_id.as_deref(),
            &entry.full_name,
            &entry.name_key,
            entry.mother_phone.as_deref(),
            entry.father_phone.as_deref(),
            entry.member_number.as_deref(),
        )?;
        if extras_enabled {
            for name in &entry.other_groups {
                link_extra_group(db, &roster_id, name)?;
            }
        }
        outcome.roster_inserted += 1;
    }
    for update in &plan.roster.updates {
        let changes = &update.changes;
        if let Some(change) = &changes.full_name {
            db.update_roster_field(&update.id, "full_name", change.after.as_deref())?;
        }
        if let Some(change) = &changes.mother_phone {
            db.update_roster_field(&update.id, "mother_phone", change.after.as_deref())?;
        }
        if let Some(change) = &changes.father_phone {
            db.update_roster_field(&update.id, "father_phone", change.after.as_deref())?;
        }
        if let Some(change) = &changes.member_number {
            db.update_roster_field(&update.id, "member_number", change.after.as_deref())?;
        }
        if update.reactivate {
            db.reactivate_roster_row(&update.id)?;
        }
        if extras_enabled {
            if let Some(extra) = &changes.extra_groups {
                for name in &extra.to_add {
                    link_extra_group(db, &update.id, name)?;
                }
                for name in &extra.to_remove {
                    if let Some(extra_group) = db.get_group_by_key(&normalize_key(name))? {
                        db.remove_roster_extra(&update.id, &extra_group.id)?;
                    }
                }
            }
        }
        outcome.roster_updated += 1;
    }
    for removal in &plan.roster.deactivations {
        db.deactivate_roster_row(&removal.id)?;
        outcome.roster_deactivated += 1;
    }

    Ok(())
}

/// Resolve an extra-group display name and link it. Unresolvable names are a
/// data-quality condition: logged and skipped, never fatal.
fn link_extra_group(db: &SyncDb, roster_id: &str, group_name: &str) -> Result<(), DbError> {
    match db.get_group_by_key(&normalize_key(group_name))? {
        Some(group) => db.add_roster_extra(roster_id, &group.id),
        None => {
            log::warn!(
                "extra group '{}' not found for roster row {}; skipping link",
                group_name,
                roster_id
            );
            Ok(())
        }
    }
}

fn apply_orphan(
    db: &SyncDb,
    orphan: &OrphanGroup,
    outcome: &mut SyncOutcome,
) -> Result<(), DbError> {
    let members = db.deactivate_members_for_group(&orphan.group_id)?;
    let roster = db.deactivate_roster_for_group(&orphan.group_id)?;
    outcome.orphan_groups_processed += 1;
    outcome.orphan_rows_deactivated += members + roster;
    log::info!(
        "orphan group '{}': deactivated {} members, {} roster rows",
        orphan.group_name,
        members,
        roster
    );
    Ok(())
}

fn apply_roles(
    db: &SyncDb,
    preview: &SyncPreview,
    outcome: &mut SyncOutcome,
) -> Result<(), DbError> {
    for diff in &preview.roles {
        for entry in &diff.inserts {
            db.upsert_role_grant(&entry.email, &entry.email_key, &diff.role, &entry.display_name)?;
            outcome.roles_upserted += 1;
        }
        for grant in &diff.reactivations {
            db.upsert_role_grant(
                &grant.email,
                &normalize_email(&grant.email),
                &diff.role,
                &grant.display_name,
            )?;
            outcome.roles_upserted += 1;
        }
        for grant in &diff.deactivations {
            db.deactivate_role_grant(&grant.id)?;
            outcome.roles_deactivated += 1;
        }
    }

    for plan in &preview.coordinators {
        let email_key = normalize_email(&plan.email);
        let Some(grant) = db.get_role_grant(&email_key, "coordinator")? else {
            log::warn!(
                "coordinator grant missing for {}; skipping project links",
                plan.email
            );
            continue;
        };
        for name in &plan.to_link {
            match db.get_project_by_key(&normalize_key(name))? {
                Some(project) => {
                    db.add_coordinator_link(&grant.id, &project.id)?;
                    outcome.links_added += 1;
                }
                None => log::warn!(
                    "project '{}' not found for coordinator {}; skipping link",
                    name,
                    plan.email
                ),
            }
        }
        for name in &plan.to_unlink {
            if let Some(project) = db.get_project_by_key(&normalize_key(name))? {
                db.remove_coordinator_link(&grant.id, &project.id)?;
                outcome.links_removed += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreSnapshot;
    use crate::preview::build_preview;
    use crate::sheet::{ProjectGroupsEntry, RosterEntry, SheetSnapshot, StaffEntry};

    fn roster_entry(name: &str, group: &str) -> RosterEntry {
        RosterEntry {
            full_name: name.to_string(),
            name_key: normalize_key(name),
            group: group.to_string(),
            group_key: normalize_key(group),
            mother_phone: None,
            father_phone: None,
            member_number: None,
            other_groups: Vec::new(),
        }
    }

    fn staff_entry(email: &str, name: &str, group: &str) -> StaffEntry {
        StaffEntry {
            email: email.to_string(),
            email_key: normalize_email(email),
            display_name: name.to_string(),
            group: group.to_string(),
            group_key: normalize_key(group),
        }
    }

    fn base_sheet() -> SheetSnapshot {
        SheetSnapshot {
            project_groups: vec![ProjectGroupsEntry {
                project: "Norte".to_string(),
                groups: vec!["Bet".to_string()],
            }],
            staff: vec![staff_entry("dani@x.com", "Dani", "Bet")],
            roster: vec![roster_entry("Ana Pérez", "Bet")],
            ..Default::default()
        }
    }

    fn commit_sheet(db: &SyncDb, sheet: &SheetSnapshot) -> SyncOutcome {
        let store = StoreSnapshot::load(db).unwrap();
        let preview = build_preview(&store, sheet);
        execute_preview(db, &preview).unwrap()
    }

    #[test]
    fn test_first_commit_creates_everything() {
        let db = SyncDb::open_in_memory().unwrap();
        let outcome = commit_sheet(&db, &base_sheet());

        assert_eq!(outcome.groups_created, 1);
        assert_eq!(outcome.projects_created, 1);
        assert_eq!(outcome.members_inserted, 1);
        assert_eq!(outcome.roster_inserted, 1);
        assert_eq!(outcome.roles_upserted, 1, "member role grant");

        let group = db.get_group_by_key("bet").unwrap().unwrap();
        let project = db.get_project_by_key("norte").unwrap().unwrap();
        let map = db.get_group_project_map().unwrap();
        assert_eq!(map.get(&group.id), Some(&project.id));

        let profile = db.get_person_profile("dani@x.com").unwrap().unwrap();
        assert_eq!(profile.display_name, "Dani");
    }

    #[test]
    fn test_recommit_same_sheet_is_a_no_op() {
        let db = SyncDb::open_in_memory().unwrap();
        commit_sheet(&db, &base_sheet());

        let outcome = commit_sheet(&db, &base_sheet());
        assert_eq!(outcome.groups_created, 0);
        assert_eq!(outcome.members_inserted, 0);
        assert_eq!(outcome.members_updated, 0);
        assert_eq!(outcome.roster_inserted, 0);
        assert_eq!(outcome.roster_updated, 0);
        assert_eq!(outcome.roles_upserted, 0);
    }

    #[test]
    fn test_disappeared_row_is_deactivated_not_deleted() {
        let db = SyncDb::open_in_memory().unwrap();
        commit_sheet(&db, &base_sheet());

        let mut sheet = base_sheet();
        sheet.roster.clear();
        let outcome = commit_sheet(&db, &sheet);
        assert_eq!(outcome.roster_deactivated, 1);

        let group = db.get_group_by_key("bet").unwrap().unwrap();
        let rows = db.get_roster_for_group(&group.id).unwrap();
        assert_eq!(rows.len(), 1, "row retained for history");
        assert!(!rows[0].active);
    }

    #[test]
    fn test_reappearing_row_is_reactivated() {
        let db = SyncDb::open_in_memory().unwrap();
        commit_sheet(&db, &base_sheet());

        let mut without = base_sheet();
        without.roster.clear();
        commit_sheet(&db, &without);

        let outcome = commit_sheet(&db, &base_sheet());
        assert_eq!(outcome.roster_inserted, 0);
        assert_eq!(outcome.roster_updated, 1);

        let group = db.get_group_by_key("bet").unwrap().unwrap();
        let rows = db.get_roster_for_group(&group.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].active);
    }

    #[test]
    fn test_orphan_group_fully_deactivated_record_retained() {
        let db = SyncDb::open_in_memory().unwrap();
        commit_sheet(&db, &base_sheet());

        // New sheet has no mention of Bet at all.
        let sheet = SheetSnapshot::default();
        let outcome = commit_sheet(&db, &sheet);
        assert_eq!(outcome.orphan_groups_processed, 1);
        assert_eq!(outcome.orphan_rows_deactivated, 2, "member + roster row");

        let group = db.get_group_by_key("bet").unwrap().unwrap();
        let rows = db.get_roster_for_group(&group.id).unwrap();
        assert!(rows.iter().all(|r| !r.active));
        let members = db.get_members_for_group(&group.id).unwrap();
        assert!(members.iter().all(|m| !m.active));
    }

    #[test]
    fn test_coordinator_grant_and_links_created() {
        let db = SyncDb::open_in_memory().unwrap();
        let mut sheet = base_sheet();
        sheet.project_groups.push(ProjectGroupsEntry {
            project: "Sur".to_string(),
            groups: vec!["Alef".to_string()],
        });
        sheet.coordinators = vec![crate::sheet::CoordinatorEntry {
            email: "ana@x.com".to_string(),
            email_key: "ana@x.com".to_string(),
            display_name: "Ana".to_string(),
            projects: vec!["Norte".to_string(), "Sur".to_string()],
        }];

        let outcome = commit_sheet(&db, &sheet);
        assert_eq!(outcome.links_added, 2);

        let grant = db.get_role_grant("ana@x.com", "coordinator").unwrap().unwrap();
        assert!(grant.active);
        let links = db.get_coordinator_links().unwrap();
        assert_eq!(links.get(&grant.id).unwrap().len(), 2);
    }

    #[test]
    fn test_group_label_refresh_keeps_identity() {
        let db = SyncDb::open_in_memory().unwrap();
        commit_sheet(&db, &base_sheet());
        let before = db.get_group_by_key("bet").unwrap().unwrap();

        let mut sheet = base_sheet();
        sheet.project_groups[0].groups = vec!["BET".to_string()];
        sheet.staff[0].group = "BET".to_string();
        sheet.roster[0].group = "BET".to_string();
        commit_sheet(&db, &sheet);

        let after = db.get_group_by_key("bet").unwrap().unwrap();
        assert_eq!(after.id, before.id, "same entity, not a competitor");
        assert_eq!(after.name, "BET", "display label refreshed");
    }

    #[test]
    fn test_extras_degrade_when_table_absent() {
        let db = SyncDb::open_in_memory().unwrap();
        db.conn_ref()
            .execute_batch("DROP TABLE roster_extra_groups;")
            .unwrap();

        let mut sheet = base_sheet();
        sheet.roster[0].other_groups = vec!["Alef".to_string()];
        sheet.project_groups.push(ProjectGroupsEntry {
            project: "Norte".to_string(),
            groups: vec!["Alef".to_string()],
        });

        // Must not fail; extras are simply not written.
        let outcome = commit_sheet(&db, &sheet);
        assert_eq!(outcome.roster_inserted, 1);
    }
}
