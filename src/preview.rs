//! Aggregates group, role and coordinator diffs into one reviewable preview.
//!
//! `build_preview` is a pure function of (store snapshot, sheet snapshot):
//! two calls without intervening writes produce byte-identical previews
//! excluding the generation timestamp. The commit path relies on this — it
//! recomputes its own preview rather than trusting the stored one for the
//! actual writes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::StoreSnapshot;
use crate::diff::{
    build_coordinator_plans, build_group_plans, build_role_diffs, CoordinatorPlan, GroupPlan,
    OrphanGroup, RoleKindDiff,
};
use crate::normalize::normalize_key;
use crate::sheet::{dedupe_roster, dedupe_staff, SheetSnapshot};

/// Per-entity-kind change counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCounts {
    pub total_sheet: usize,
    pub total_active: usize,
    pub insert: usize,
    pub update: usize,
    pub deactivate: usize,
    pub reactivate: usize,
}

/// Global counters for the preview header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub members: EntityCounts,
    pub roster: EntityCounts,
    pub roles: EntityCounts,
    pub new_groups: usize,
    pub new_projects: usize,
    pub orphan_groups: usize,
    pub orphan_members: usize,
    pub orphan_roster: usize,
}

/// The full computed diff snapshot an operator reviews before committing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPreview {
    pub generated_at: String,
    pub groups: Vec<GroupPlan>,
    pub orphans: Vec<OrphanGroup>,
    /// Newly-detected display names, for "what's new" callouts.
    pub new_groups: Vec<String>,
    pub new_projects: Vec<String>,
    pub roles: Vec<RoleKindDiff>,
    pub coordinators: Vec<CoordinatorPlan>,
    pub summary: SyncSummary,
}

impl SyncPreview {
    /// Content hash of the preview with the generation timestamp stripped.
    /// Two previews of the same state hash identically.
    pub fn content_hash(&self) -> String {
        let mut stripped = self.clone();
        stripped.generated_at = String::new();
        let bytes = serde_json::to_vec(&stripped).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Assemble the aggregate preview from the two snapshots.
pub fn build_preview(store: &StoreSnapshot, sheet: &SheetSnapshot) -> SyncPreview {
    let (groups, orphans) = build_group_plans(store, sheet);
    let roles = build_role_diffs(store, sheet);
    let coordinators = build_coordinator_plans(store, sheet);

    let mut new_groups: Vec<String> = groups
        .iter()
        .filter(|p| p.is_new_group)
        .map(|p| p.group_name.clone())
        .collect();
    new_groups.sort_by_key(|n| normalize_key(n));

    let mut new_projects: Vec<String> = Vec::new();
    let mut seen_project_keys = std::collections::HashSet::new();
    for plan in &groups {
        if plan.is_new_project {
            if let Some(name) = &plan.project_name {
                if seen_project_keys.insert(normalize_key(name)) {
                    new_projects.push(name.clone());
                }
            }
        }
    }
    new_projects.sort_by_key(|n| normalize_key(n));

    let summary = summarize(store, sheet, &groups, &orphans, &roles, &new_groups, &new_projects);

    SyncPreview {
        generated_at: Utc::now().to_rfc3339(),
        groups,
        orphans,
        new_groups,
        new_projects,
        roles,
        coordinators,
        summary,
    }
}

fn summarize(
    store: &StoreSnapshot,
    sheet: &SheetSnapshot,
    groups: &[GroupPlan],
    orphans: &[OrphanGroup],
    roles: &[RoleKindDiff],
    new_groups: &[String],
    new_projects: &[String],
) -> SyncSummary {
    let mut summary = SyncSummary::default();

    // Sheet totals count deduplicated entries, mirroring what the diffs saw.
    let mut staff_by_group: std::collections::HashMap<&str, Vec<crate::sheet::StaffEntry>> =
        std::collections::HashMap::new();
    for entry in &sheet.staff {
        if !entry.group_key.is_empty() {
            staff_by_group
                .entry(entry.group_key.as_str())
                .or_default()
                .push(entry.clone());
        }
    }
    summary.members.total_sheet = staff_by_group
        .into_values()
        .map(|v| dedupe_staff(v).len())
        .sum();

    let mut roster_by_group: std::collections::HashMap<&str, Vec<crate::sheet::RosterEntry>> =
        std::collections::HashMap::new();
    for entry in &sheet.roster {
        if !entry.group_key.is_empty() {
            roster_by_group
                .entry(entry.group_key.as_str())
                .or_default()
                .push(entry.clone());
        }
    }
    summary.roster.total_sheet = roster_by_group
        .into_values()
        .map(|v| dedupe_roster(v).len())
        .sum();

    summary.members.total_active = store
        .members_by_group
        .values()
        .flatten()
        .filter(|m| m.active)
        .count();
    summary.roster.total_active = store
        .roster_by_group
        .values()
        .flatten()
        .filter(|r| r.active)
        .count();

    for plan in groups {
        summary.members.insert += plan.members.inserts.len();
        summary.members.update += plan.members.updates.len();
        summary.members.deactivate += plan.members.deactivations.len();
        summary.members.reactivate += plan.members.reactivation_count();

        summary.roster.insert += plan.roster.inserts.len();
        summary.roster.update += plan.roster.updates.len();
        summary.roster.deactivate += plan.roster.deactivations.len();
        summary.roster.reactivate += plan.roster.reactivation_count();
    }

    summary.roles.total_active = store.role_grants.iter().filter(|g| g.active).count();
    for diff in roles {
        summary.roles.insert += diff.inserts.len();
        summary.roles.update += diff.reactivations.len();
        summary.roles.reactivate += diff.reactivations.len();
        summary.roles.deactivate += diff.deactivations.len();
    }
    // One pass per role kind, with the same per-kind email dedup the diff applied.
    summary.roles.total_sheet =
        distinct_email_count(sheet.staff.iter().map(|e| e.email_key.as_str()))
            + distinct_email_count(sheet.coordinators.iter().map(|e| e.email_key.as_str()))
            + distinct_email_count(sheet.directors.iter().map(|e| e.email_key.as_str()))
            + distinct_email_count(sheet.admins.iter().map(|e| e.email_key.as_str()));

    summary.new_groups = new_groups.len();
    summary.new_projects = new_projects.len();
    summary.orphan_groups = orphans.len();
    summary.orphan_members = orphans.iter().map(|o| o.members.len()).sum();
    summary.orphan_roster = orphans.iter().map(|o| o.roster.len()).sum();

    summary
}

fn distinct_email_count<'a>(keys: impl Iterator<Item = &'a str>) -> usize {
    keys.collect::<std::collections::HashSet<_>>().len()
}
