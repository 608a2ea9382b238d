//! The reconciliation diff engine.
//!
//! Pure functions from (stored snapshot, sheet snapshot) to change plans.
//! Data-quality problems never throw here — unknown project names, duplicate
//! rows and missing fields all surface as plan content for human review.
//! Matching is exclusively over normalized keys; raw display strings are
//! only carried for reporting and for refreshing stale labels.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::db::{DbGroupMember, DbRosterRow, StoreSnapshot};
use crate::normalize::normalize_key;
use crate::sheet::{
    dedupe_coordinators, dedupe_role_entries, dedupe_roster, dedupe_staff, CoordinatorEntry,
    RoleEntry, RosterEntry, SheetSnapshot, StaffEntry,
};

/// Role kinds, in the fixed pass order.
pub const ROLE_KINDS: &[&str] = &["member", "coordinator", "director", "admin"];

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// A before/after pair for one changed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub before: Option<String>,
    pub after: Option<String>,
}

impl FieldChange {
    fn diff(before: Option<&str>, after: Option<&str>) -> Option<Self> {
        let before = before.map(str::trim).filter(|s| !s.is_empty());
        let after = after.map(str::trim).filter(|s| !s.is_empty());
        if before == after {
            None
        } else {
            Some(FieldChange {
                before: before.map(String::from),
                after: after.map(String::from),
            })
        }
    }
}

/// Extra-group membership changes, as display-name lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraGroupsChange {
    #[serde(rename = "agregar")]
    pub to_add: Vec<String>,
    #[serde(rename = "quitar")]
    pub to_remove: Vec<String>,
}

/// An update to an existing membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberUpdate {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<FieldChange>,
    pub reactivate: bool,
}

/// An active membership row slated for deactivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRemoval {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

/// The membership change plan for one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDiff {
    pub inserts: Vec<StaffEntry>,
    pub updates: Vec<MemberUpdate>,
    pub deactivations: Vec<MemberRemoval>,
}

impl MemberDiff {
    pub fn reactivation_count(&self) -> usize {
        self.updates.iter().filter(|u| u.reactivate).count()
    }
}

/// Field-level changes on an existing roster row. Only changed fields are
/// populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<FieldChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mother_phone: Option<FieldChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub father_phone: Option<FieldChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_number: Option<FieldChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_groups: Option<ExtraGroupsChange>,
}

impl RosterChanges {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.mother_phone.is_none()
            && self.father_phone.is_none()
            && self.member_number.is_none()
            && self.extra_groups.is_none()
    }
}

/// An update to an existing roster row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterUpdate {
    pub id: String,
    pub full_name: String,
    pub changes: RosterChanges,
    pub reactivate: bool,
}

/// An active roster row slated for deactivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterRemoval {
    pub id: String,
    pub full_name: String,
}

/// The roster change plan for one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterDiff {
    pub inserts: Vec<RosterEntry>,
    pub updates: Vec<RosterUpdate>,
    pub deactivations: Vec<RosterRemoval>,
}

impl RosterDiff {
    pub fn reactivation_count(&self) -> usize {
        self.updates.iter().filter(|u| u.reactivate).count()
    }
}

/// The full change plan for one sheet-declared group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPlan {
    /// Stored group id when the group already exists.
    pub group_id: Option<String>,
    pub group_name: String,
    pub group_key: String,
    pub is_new_group: bool,
    /// Project the group is declared under, when the sheet declares one.
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub is_new_project: bool,
    pub members: MemberDiff,
    pub roster: RosterDiff,
}

/// A stored group no longer referenced anywhere in the sheet. Its active
/// rows are slated for full deactivation; the group record itself survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanGroup {
    pub group_id: String,
    pub group_name: String,
    /// Project historically linked to the group, for reporting.
    pub project_name: Option<String>,
    pub members: Vec<MemberRemoval>,
    pub roster: Vec<RosterRemoval>,
}

/// Reference to an existing role grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleGrantRef {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

/// Insert/reactivate/deactivate plan for one role kind, keyed by email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleKindDiff {
    pub role: String,
    pub inserts: Vec<RoleEntry>,
    pub reactivations: Vec<RoleGrantRef>,
    pub deactivations: Vec<RoleGrantRef>,
}

/// Per-coordinator project-link reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorPlan {
    pub email: String,
    pub display_name: String,
    /// Project names declared on the sheet.
    #[serde(rename = "proyectos")]
    pub declared: Vec<String>,
    /// Projects the grant is currently linked to.
    #[serde(rename = "proyectosAsignados")]
    pub assigned: Vec<String>,
    /// Declared projects not yet linked.
    #[serde(rename = "proyectosNuevos")]
    pub to_link: Vec<String>,
    /// Linked projects no longer declared.
    #[serde(rename = "proyectosQuitar")]
    pub to_unlink: Vec<String>,
    /// Declared names that resolve to no known project. Reported, never
    /// silently dropped.
    #[serde(rename = "proyectosInexistentes")]
    pub unknown: Vec<String>,
}

// ---------------------------------------------------------------------------
// Per-group diffs
// ---------------------------------------------------------------------------

/// Diff membership rows of one group against its deduplicated sheet entries.
pub fn diff_members(existing: &[DbGroupMember], entries: &[StaffEntry]) -> MemberDiff {
    let by_key: HashMap<&str, &DbGroupMember> = existing
        .iter()
        .map(|m| (m.email_key.as_str(), m))
        .collect();
    let sheet_keys: HashSet<&str> = entries.iter().map(|e| e.email_key.as_str()).collect();

    let mut diff = MemberDiff::default();

    for entry in entries {
        match by_key.get(entry.email_key.as_str()) {
            None => diff.inserts.push(entry.clone()),
            Some(row) => {
                let display_name = FieldChange::diff(
                    Some(row.display_name.as_str()),
                    Some(entry.display_name.as_str()),
                );
                let reactivate = !row.active;
                if display_name.is_some() || reactivate {
                    diff.updates.push(MemberUpdate {
                        id: row.id.clone(),
                        email: entry.email.clone(),
                        display_name,
                        reactivate,
                    });
                }
            }
        }
    }

    for row in existing {
        if row.active && !sheet_keys.contains(row.email_key.as_str()) {
            diff.deactivations.push(MemberRemoval {
                id: row.id.clone(),
                email: row.email.clone(),
                display_name: row.display_name.clone(),
            });
        }
    }

    diff
}

/// Diff roster rows of one group against its deduplicated sheet entries.
///
/// `extras` is the current extra-group linkage (`None` when the capability is
/// absent — extra-group changes are then not computed at all).
pub fn diff_roster(
    existing: &[DbRosterRow],
    entries: &[RosterEntry],
    extras: Option<&HashMap<String, BTreeSet<String>>>,
    store: &StoreSnapshot,
) -> RosterDiff {
    let by_key: HashMap<&str, &DbRosterRow> =
        existing.iter().map(|r| (r.name_key.as_str(), r)).collect();
    let sheet_keys: HashSet<&str> = entries.iter().map(|e| e.name_key.as_str()).collect();

    let mut diff = RosterDiff::default();

    for entry in entries {
        match by_key.get(entry.name_key.as_str()) {
            None => diff.inserts.push(entry.clone()),
            Some(row) => {
                let changes = RosterChanges {
                    full_name: FieldChange::diff(
                        Some(row.full_name.as_str()),
                        Some(entry.full_name.as_str()),
                    ),
                    mother_phone: FieldChange::diff(
                        row.mother_phone.as_deref(),
                        entry.mother_phone.as_deref(),
                    ),
                    father_phone: FieldChange::diff(
                        row.father_phone.as_deref(),
                        entry.father_phone.as_deref(),
                    ),
                    member_number: FieldChange::diff(
                        row.member_number.as_deref(),
                        entry.member_number.as_deref(),
                    ),
                    extra_groups: extras
                        .and_then(|map| diff_extra_groups(row, entry, map, store)),
                };
                let reactivate = !row.active;
                if !changes.is_empty() || reactivate {
                    diff.updates.push(RosterUpdate {
                        id: row.id.clone(),
                        full_name: entry.full_name.clone(),
                        changes,
                        reactivate,
                    });
                }
            }
        }
    }

    for row in existing {
        if row.active && !sheet_keys.contains(row.name_key.as_str()) {
            diff.deactivations.push(RosterRemoval {
                id: row.id.clone(),
                full_name: row.full_name.clone(),
            });
        }
    }

    diff
}

fn diff_extra_groups(
    row: &DbRosterRow,
    entry: &RosterEntry,
    extras: &HashMap<String, BTreeSet<String>>,
    store: &StoreSnapshot,
) -> Option<ExtraGroupsChange> {
    let current_ids = extras.get(&row.id);
    let current_keys: HashMap<String, &str> = current_ids
        .into_iter()
        .flatten()
        .map(|id| {
            let name = store.group_name_by_id(id).unwrap_or(id.as_str());
            (normalize_key(name), name)
        })
        .collect();

    let mut declared_keys: HashSet<String> = HashSet::new();
    let mut to_add: Vec<String> = Vec::new();
    for name in &entry.other_groups {
        let key = normalize_key(name);
        if declared_keys.insert(key.clone()) && !current_keys.contains_key(&key) {
            to_add.push(name.clone());
        }
    }

    let mut to_remove: Vec<String> = current_keys
        .iter()
        .filter(|(key, _)| !declared_keys.contains(key.as_str()))
        .map(|(_, name)| name.to_string())
        .collect();
    to_remove.sort();

    if to_add.is_empty() && to_remove.is_empty() {
        None
    } else {
        Some(ExtraGroupsChange { to_add, to_remove })
    }
}

// ---------------------------------------------------------------------------
// Group orchestration
// ---------------------------------------------------------------------------

struct GroupDecl {
    name: String,
    /// Raw project label of the first declaration, if any.
    project: Option<String>,
}

/// Every group key the sheet mentions, with the first-wins project label.
fn collect_group_declarations(sheet: &SheetSnapshot) -> Vec<(String, GroupDecl)> {
    let mut order: Vec<String> = Vec::new();
    let mut decls: HashMap<String, GroupDecl> = HashMap::new();

    let mut declare = |raw_name: &str, project: Option<&str>| {
        let key = normalize_key(raw_name);
        if key.is_empty() {
            return;
        }
        match decls.get_mut(&key) {
            None => {
                order.push(key.clone());
                decls.insert(
                    key,
                    GroupDecl {
                        name: raw_name.to_string(),
                        project: project.map(String::from),
                    },
                );
            }
            Some(decl) => {
                // First project declaration wins; later duplicates are ignored.
                if decl.project.is_none() {
                    decl.project = project.map(String::from);
                }
            }
        }
    };

    for listing in &sheet.project_groups {
        for group in &listing.groups {
            declare(group, Some(&listing.project));
        }
    }
    for entry in &sheet.staff {
        declare(&entry.group, None);
    }
    for entry in &sheet.roster {
        declare(&entry.group, None);
    }

    order
        .into_iter()
        .filter_map(|key| decls.remove_entry(&key))
        .collect()
}

/// Build the per-group change plans plus the orphan list.
///
/// Plans are sorted by `(project, group)` normalized keys for deterministic
/// reporting and commit order.
pub fn build_group_plans(
    store: &StoreSnapshot,
    sheet: &SheetSnapshot,
) -> (Vec<GroupPlan>, Vec<OrphanGroup>) {
    let declarations = collect_group_declarations(sheet);
    let declared_keys: HashSet<String> = declarations.iter().map(|(k, _)| k.clone()).collect();

    // Bucket sheet entries per group key, deduplicating within each group.
    let mut staff_by_group: HashMap<String, Vec<StaffEntry>> = HashMap::new();
    for entry in &sheet.staff {
        if !entry.group_key.is_empty() {
            staff_by_group
                .entry(entry.group_key.clone())
                .or_default()
                .push(entry.clone());
        }
    }
    let mut roster_by_group: HashMap<String, Vec<RosterEntry>> = HashMap::new();
    for entry in &sheet.roster {
        if !entry.group_key.is_empty() {
            roster_by_group
                .entry(entry.group_key.clone())
                .or_default()
                .push(entry.clone());
        }
    }

    let empty_members: Vec<DbGroupMember> = Vec::new();
    let empty_roster: Vec<DbRosterRow> = Vec::new();

    let mut plans: Vec<GroupPlan> = declarations
        .into_iter()
        .map(|(group_key, decl)| {
            let stored = store.group_by_key(&group_key);
            let (project_id, project_name, is_new_project) = match &decl.project {
                None => (None, None, false),
                Some(raw) => match store.project_by_key(&normalize_key(raw)) {
                    Some(project) => (Some(project.id.clone()), Some(raw.clone()), false),
                    None => (None, Some(raw.clone()), true),
                },
            };

            let existing_members = stored
                .map(|g| store.members_by_group.get(&g.id).unwrap_or(&empty_members))
                .unwrap_or(&empty_members);
            let existing_roster = stored
                .map(|g| store.roster_by_group.get(&g.id).unwrap_or(&empty_roster))
                .unwrap_or(&empty_roster);

            let staff_entries =
                dedupe_staff(staff_by_group.remove(&group_key).unwrap_or_default());
            let roster_entries =
                dedupe_roster(roster_by_group.remove(&group_key).unwrap_or_default());

            GroupPlan {
                group_id: stored.map(|g| g.id.clone()),
                group_name: decl.name,
                group_key,
                is_new_group: stored.is_none(),
                project_id,
                project_name,
                is_new_project,
                members: diff_members(existing_members, &staff_entries),
                roster: diff_roster(
                    existing_roster,
                    &roster_entries,
                    store.roster_extras.as_ref(),
                    store,
                ),
            }
        })
        .collect();

    plans.sort_by(|a, b| {
        let pa = a.project_name.as_deref().map(normalize_key).unwrap_or_default();
        let pb = b.project_name.as_deref().map(normalize_key).unwrap_or_default();
        (pa, &a.group_key).cmp(&(pb, &b.group_key))
    });

    // Orphans: stored groups whose key appears nowhere in the sheet.
    let mut orphans: Vec<OrphanGroup> = store
        .groups
        .iter()
        .filter(|g| !declared_keys.contains(g.name_key.as_str()))
        .map(|group| {
            let members = store
                .members_by_group
                .get(&group.id)
                .into_iter()
                .flatten()
                .filter(|m| m.active)
                .map(|m| MemberRemoval {
                    id: m.id.clone(),
                    email: m.email.clone(),
                    display_name: m.display_name.clone(),
                })
                .collect();
            let roster = store
                .roster_by_group
                .get(&group.id)
                .into_iter()
                .flatten()
                .filter(|r| r.active)
                .map(|r| RosterRemoval {
                    id: r.id.clone(),
                    full_name: r.full_name.clone(),
                })
                .collect();
            OrphanGroup {
                group_id: group.id.clone(),
                group_name: group.name.clone(),
                project_name: store
                    .historical_project_for_group(&group.id)
                    .map(|p| p.name.clone()),
                members,
                roster,
            }
        })
        .collect();

    orphans.sort_by(|a, b| {
        let pa = a.project_name.as_deref().map(normalize_key).unwrap_or_default();
        let pb = b.project_name.as_deref().map(normalize_key).unwrap_or_default();
        (pa, normalize_key(&a.group_name)).cmp(&(pb, normalize_key(&b.group_name)))
    });

    (plans, orphans)
}

// ---------------------------------------------------------------------------
// Role and coordinator diffs
// ---------------------------------------------------------------------------

fn role_entries_for_kind(sheet: &SheetSnapshot, kind: &str) -> Vec<RoleEntry> {
    let entries: Vec<RoleEntry> = match kind {
        "member" => sheet
            .staff
            .iter()
            .map(|e| RoleEntry {
                email: e.email.clone(),
                email_key: e.email_key.clone(),
                display_name: e.display_name.clone(),
            })
            .collect(),
        "coordinator" => sheet
            .coordinators
            .iter()
            .map(|e| RoleEntry {
                email: e.email.clone(),
                email_key: e.email_key.clone(),
                display_name: e.display_name.clone(),
            })
            .collect(),
        "director" => sheet.directors.clone(),
        "admin" => sheet.admins.clone(),
        _ => Vec::new(),
    };
    dedupe_role_entries(entries)
}

/// Build the insert/reactivate/deactivate plan for every role kind.
pub fn build_role_diffs(store: &StoreSnapshot, sheet: &SheetSnapshot) -> Vec<RoleKindDiff> {
    ROLE_KINDS
        .iter()
        .map(|kind| {
            let entries = role_entries_for_kind(sheet, kind);
            let sheet_keys: HashSet<&str> =
                entries.iter().map(|e| e.email_key.as_str()).collect();

            let mut diff = RoleKindDiff {
                role: kind.to_string(),
                inserts: Vec::new(),
                reactivations: Vec::new(),
                deactivations: Vec::new(),
            };

            let grants: HashMap<&str, &crate::db::DbRoleGrant> = store
                .role_grants
                .iter()
                .filter(|g| g.role == *kind)
                .map(|g| (g.email_key.as_str(), g))
                .collect();

            for entry in &entries {
                match grants.get(entry.email_key.as_str()) {
                    None => diff.inserts.push(entry.clone()),
                    Some(grant) if !grant.active => diff.reactivations.push(RoleGrantRef {
                        id: grant.id.clone(),
                        email: grant.email.clone(),
                        display_name: entry.display_name.clone(),
                    }),
                    Some(_) => {}
                }
            }

            for grant in store.role_grants.iter().filter(|g| g.role == *kind) {
                if grant.active && !sheet_keys.contains(grant.email_key.as_str()) {
                    diff.deactivations.push(RoleGrantRef {
                        id: grant.id.clone(),
                        email: grant.email.clone(),
                        display_name: grant.display_name.clone(),
                    });
                }
            }

            diff
        })
        .collect()
}

/// Build the per-coordinator project-link plans.
///
/// A declared project name is "known" when it matches a stored project or a
/// project declared in the sheet's own listings (it will exist by the time
/// the role pass runs).
pub fn build_coordinator_plans(
    store: &StoreSnapshot,
    sheet: &SheetSnapshot,
) -> Vec<CoordinatorPlan> {
    let mut known_project_keys: HashSet<String> = store
        .projects
        .iter()
        .map(|p| p.name_key.clone())
        .collect();
    for listing in &sheet.project_groups {
        known_project_keys.insert(normalize_key(&listing.project));
    }

    let coordinators: Vec<CoordinatorEntry> = dedupe_coordinators(sheet.coordinators.clone());

    coordinators
        .into_iter()
        .map(|entry| {
            let grant = store
                .role_grants
                .iter()
                .find(|g| g.role == "coordinator" && g.email_key == entry.email_key);

            let mut assigned: Vec<String> = grant
                .and_then(|g| store.coordinator_links.get(&g.id))
                .into_iter()
                .flatten()
                .map(|project_id| {
                    store
                        .project_name_by_id(project_id)
                        .unwrap_or(project_id.as_str())
                        .to_string()
                })
                .collect();
            assigned.sort();
            let assigned_keys: HashSet<String> =
                assigned.iter().map(|n| normalize_key(n)).collect();

            let mut declared_keys: HashSet<String> = HashSet::new();
            let mut to_link: Vec<String> = Vec::new();
            let mut unknown: Vec<String> = Vec::new();
            for name in &entry.projects {
                let key = normalize_key(name);
                if !declared_keys.insert(key.clone()) {
                    continue;
                }
                if !known_project_keys.contains(&key) {
                    unknown.push(name.clone());
                } else if !assigned_keys.contains(&key) {
                    to_link.push(name.clone());
                }
            }

            let to_unlink: Vec<String> = assigned
                .iter()
                .filter(|name| !declared_keys.contains(&normalize_key(name)))
                .cloned()
                .collect();

            CoordinatorPlan {
                email: entry.email,
                display_name: entry.display_name,
                declared: entry.projects,
                assigned,
                to_link,
                to_unlink,
                unknown,
            }
        })
        .collect()
}
