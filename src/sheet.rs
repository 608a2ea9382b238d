//! Institutional-sheet ingestion: transport trait, header resolution, and
//! typed entry parsers.
//!
//! The first row of every sheet is the header. Header cells are normalized and
//! matched against a per-entity synonym table, so "Tel Madre", "telefono madre"
//! and "Teléfono de la madre" all resolve to the mother-phone column. The first
//! recognized occurrence of a header wins; duplicate headers are ignored.
//!
//! Rows missing their natural-key field (email, or full name for the roster)
//! are skipped silently — blank trailing rows are expected, not an error.
//! Parsers never deduplicate; duplicate handling happens in the diff layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::normalize::{normalize_email, normalize_key};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Read access to the institutional workbook. Implementations fail with
/// `SyncError::Transport` on auth/network/file problems.
pub trait SheetSource {
    fn read_rows(&self, sheet_name: &str) -> Result<Vec<Vec<String>>, SyncError>;
}

/// `SheetSource` backed by an `.xlsx`/`.ods` workbook on disk via calamine.
pub struct WorkbookSource {
    path: PathBuf,
}

impl WorkbookSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SheetSource for WorkbookSource {
    fn read_rows(&self, sheet_name: &str) -> Result<Vec<Vec<String>>, SyncError> {
        use calamine::{open_workbook_auto, Reader};

        let mut workbook = open_workbook_auto(&self.path)
            .map_err(|e| SyncError::Transport(format!("{}: {}", self.path.display(), e)))?;

        // A missing tab is empty data, not a transport failure.
        if !workbook.sheet_names().iter().any(|n| n == sheet_name) {
            return Ok(Vec::new());
        }

        let range = workbook
            .worksheet_range(sheet_name)
            .map_err(|e| SyncError::Transport(format!("sheet '{}': {}", sheet_name, e)))?;

        Ok(range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect())
    }
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => format!("{}", dt),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// In-memory `SheetSource` for tests and programmatic snapshots.
#[derive(Default)]
pub struct FixtureSource {
    sheets: HashMap<String, Vec<Vec<String>>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, name: &str, rows: Vec<Vec<&str>>) -> Self {
        self.sheets.insert(
            name.to_string(),
            rows.into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
        );
        self
    }
}

impl SheetSource for FixtureSource {
    fn read_rows(&self, sheet_name: &str) -> Result<Vec<Vec<String>>, SyncError> {
        // A missing tab is empty data, not a transport failure — regional
        // workbooks routinely omit sheets they don't use.
        Ok(self.sheets.get(sheet_name).cloned().unwrap_or_default())
    }
}

/// Names of the workbook tabs holding each entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetConfig {
    pub staff_sheet: String,
    pub coordinators_sheet: String,
    pub directors_sheet: String,
    pub admins_sheet: String,
    pub roster_sheet: String,
    pub projects_sheet: String,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            staff_sheet: "Equipos".to_string(),
            coordinators_sheet: "Coordinadores".to_string(),
            directors_sheet: "Directores".to_string(),
            admins_sheet: "Administradores".to_string(),
            roster_sheet: "Janijim".to_string(),
            projects_sheet: "Proyectos".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed entries
// ---------------------------------------------------------------------------

/// A role-bearing adult attached to a group (staff sheet row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffEntry {
    pub email: String,
    pub email_key: String,
    pub display_name: String,
    pub group: String,
    pub group_key: String,
}

/// A coordinator with their declared project names (wire field `proyectos`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorEntry {
    pub email: String,
    pub email_key: String,
    pub display_name: String,
    #[serde(rename = "proyectos")]
    pub projects: Vec<String>,
}

/// Minimal person entry for director/admin role sheets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleEntry {
    pub email: String,
    pub email_key: String,
    pub display_name: String,
}

/// A roll-call participant row. The normalized full name is the natural key
/// within a group; there is no global person identity in the sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub full_name: String,
    pub name_key: String,
    pub group: String,
    pub group_key: String,
    pub mother_phone: Option<String>,
    pub father_phone: Option<String>,
    pub member_number: Option<String>,
    /// Display names of additional groups this participant is also counted in.
    pub other_groups: Vec<String>,
}

/// A project→groups declaration from the projects sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGroupsEntry {
    pub project: String,
    pub groups: Vec<String>,
}

/// Everything the workbook currently declares, parsed and typed.
#[derive(Debug, Clone, Default)]
pub struct SheetSnapshot {
    pub staff: Vec<StaffEntry>,
    pub coordinators: Vec<CoordinatorEntry>,
    pub directors: Vec<RoleEntry>,
    pub admins: Vec<RoleEntry>,
    pub roster: Vec<RosterEntry>,
    pub project_groups: Vec<ProjectGroupsEntry>,
}

// ---------------------------------------------------------------------------
// Header resolution
// ---------------------------------------------------------------------------

const EMAIL_HEADERS: &[&str] = &["email", "e-mail", "mail", "correo", "correo electronico"];
const NAME_HEADERS: &[&str] = &["nombre", "nombre completo", "nombre y apellido"];
const GROUP_HEADERS: &[&str] = &["grupo", "kvutza"];
const MOTHER_PHONE_HEADERS: &[&str] = &[
    "tel madre",
    "telefono madre",
    "telefono de la madre",
    "cel madre",
    "celular madre",
];
const FATHER_PHONE_HEADERS: &[&str] = &[
    "tel padre",
    "telefono padre",
    "telefono del padre",
    "cel padre",
    "celular padre",
];
const MEMBER_NUMBER_HEADERS: &[&str] = &["socio", "nro socio", "numero de socio"];
const OTHER_GROUPS_HEADERS: &[&str] = &["otros grupos", "tambien en", "grupos adicionales"];
const COORD_PROJECTS_HEADERS: &[&str] = &["proyectos", "proyecto"];
const PROJECT_HEADERS: &[&str] = &["proyecto", "nombre proyecto"];
const PROJECT_GROUPS_HEADERS: &[&str] = &["grupos", "grupos del proyecto"];

/// Find the first column whose normalized header matches any synonym.
/// Later duplicate headers are ignored.
fn header_index(header: &[String], synonyms: &[&str]) -> Option<usize> {
    header
        .iter()
        .position(|cell| synonyms.contains(&normalize_key(cell).as_str()))
}

/// Fetch a trimmed, non-empty cell by optional column index.
fn cell_at(row: &[String], idx: Option<usize>) -> Option<String> {
    let value = row.get(idx?)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Split a multi-value cell ("Norte, Sur; Centro") into trimmed parts.
fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Parse the staff sheet (email + name + group per row).
pub fn parse_staff(rows: &[Vec<String>]) -> Vec<StaffEntry> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    let email_col = header_index(header, EMAIL_HEADERS);
    let name_col = header_index(header, NAME_HEADERS);
    let group_col = header_index(header, GROUP_HEADERS);

    data.iter()
        .filter_map(|row| {
            let email = cell_at(row, email_col)?;
            let group = cell_at(row, group_col).unwrap_or_default();
            Some(StaffEntry {
                email_key: normalize_email(&email),
                email,
                display_name: cell_at(row, name_col).unwrap_or_default(),
                group_key: normalize_key(&group),
                group,
            })
        })
        .collect()
}

/// Parse the coordinators sheet (email + name + declared project list).
pub fn parse_coordinators(rows: &[Vec<String>]) -> Vec<CoordinatorEntry> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    let email_col = header_index(header, EMAIL_HEADERS);
    let name_col = header_index(header, NAME_HEADERS);
    let projects_col = header_index(header, COORD_PROJECTS_HEADERS);

    data.iter()
        .filter_map(|row| {
            let email = cell_at(row, email_col)?;
            Some(CoordinatorEntry {
                email_key: normalize_email(&email),
                email,
                display_name: cell_at(row, name_col).unwrap_or_default(),
                projects: cell_at(row, projects_col)
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Parse a minimal role sheet (directors, admins): email + name.
pub fn parse_role_list(rows: &[Vec<String>]) -> Vec<RoleEntry> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    let email_col = header_index(header, EMAIL_HEADERS);
    let name_col = header_index(header, NAME_HEADERS);

    data.iter()
        .filter_map(|row| {
            let email = cell_at(row, email_col)?;
            Some(RoleEntry {
                email_key: normalize_email(&email),
                email,
                display_name: cell_at(row, name_col).unwrap_or_default(),
            })
        })
        .collect()
}

/// Parse the roster ("janijim") sheet.
pub fn parse_roster(rows: &[Vec<String>]) -> Vec<RosterEntry> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    let name_col = header_index(header, NAME_HEADERS);
    let group_col = header_index(header, GROUP_HEADERS);
    let mother_col = header_index(header, MOTHER_PHONE_HEADERS);
    let father_col = header_index(header, FATHER_PHONE_HEADERS);
    let number_col = header_index(header, MEMBER_NUMBER_HEADERS);
    let others_col = header_index(header, OTHER_GROUPS_HEADERS);

    data.iter()
        .filter_map(|row| {
            let full_name = cell_at(row, name_col)?;
            let group = cell_at(row, group_col).unwrap_or_default();
            Some(RosterEntry {
                name_key: normalize_key(&full_name),
                full_name,
                group_key: normalize_key(&group),
                group,
                mother_phone: cell_at(row, mother_col),
                father_phone: cell_at(row, father_col),
                member_number: cell_at(row, number_col),
                other_groups: cell_at(row, others_col)
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Parse the projects sheet (project name + comma-separated group list).
pub fn parse_project_groups(rows: &[Vec<String>]) -> Vec<ProjectGroupsEntry> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    let project_col = header_index(header, PROJECT_HEADERS);
    let groups_col = header_index(header, PROJECT_GROUPS_HEADERS);

    data.iter()
        .filter_map(|row| {
            let project = cell_at(row, project_col)?;
            Some(ProjectGroupsEntry {
                project,
                groups: cell_at(row, groups_col)
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Read every configured sheet and assemble the typed snapshot.
pub fn load_snapshot(
    source: &dyn SheetSource,
    config: &SheetConfig,
) -> Result<SheetSnapshot, SyncError> {
    let snapshot = SheetSnapshot {
        staff: parse_staff(&source.read_rows(&config.staff_sheet)?),
        coordinators: parse_coordinators(&source.read_rows(&config.coordinators_sheet)?),
        directors: parse_role_list(&source.read_rows(&config.directors_sheet)?),
        admins: parse_role_list(&source.read_rows(&config.admins_sheet)?),
        roster: parse_roster(&source.read_rows(&config.roster_sheet)?),
        project_groups: parse_project_groups(&source.read_rows(&config.projects_sheet)?),
    };
    log::debug!(
        "sheet snapshot: {} staff, {} coordinators, {} directors, {} admins, {} roster, {} project listings",
        snapshot.staff.len(),
        snapshot.coordinators.len(),
        snapshot.directors.len(),
        snapshot.admins.len(),
        snapshot.roster.len(),
        snapshot.project_groups.len(),
    );
    Ok(snapshot)
}

/// True when the path looks like a workbook calamine can open.
pub fn is_workbook_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("xlsx") | Some("xls") | Some("xlsb") | Some("ods")
    )
}

// ---------------------------------------------------------------------------
// Duplicate handling (first wins, best-effort field merge)
// ---------------------------------------------------------------------------

/// Merge duplicate roster rows sharing a name key: the first row's values win,
/// but non-empty fields from later duplicates fill fields the first left empty.
pub fn dedupe_roster(entries: Vec<RosterEntry>) -> Vec<RosterEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, RosterEntry> = HashMap::new();

    for entry in entries {
        match merged.get_mut(&entry.name_key) {
            None => {
                order.push(entry.name_key.clone());
                merged.insert(entry.name_key.clone(), entry);
            }
            Some(first) => {
                if first.mother_phone.is_none() {
                    first.mother_phone = entry.mother_phone;
                }
                if first.father_phone.is_none() {
                    first.father_phone = entry.father_phone;
                }
                if first.member_number.is_none() {
                    first.member_number = entry.member_number;
                }
                if first.other_groups.is_empty() {
                    first.other_groups = entry.other_groups;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

/// Merge duplicate staff rows sharing an email key within a group.
pub fn dedupe_staff(entries: Vec<StaffEntry>) -> Vec<StaffEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, StaffEntry> = HashMap::new();

    for entry in entries {
        match merged.get_mut(&entry.email_key) {
            None => {
                order.push(entry.email_key.clone());
                merged.insert(entry.email_key.clone(), entry);
            }
            Some(first) => {
                if first.display_name.is_empty() {
                    first.display_name = entry.display_name;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

/// Merge duplicate coordinator rows sharing an email key.
pub fn dedupe_coordinators(entries: Vec<CoordinatorEntry>) -> Vec<CoordinatorEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, CoordinatorEntry> = HashMap::new();

    for entry in entries {
        match merged.get_mut(&entry.email_key) {
            None => {
                order.push(entry.email_key.clone());
                merged.insert(entry.email_key.clone(), entry);
            }
            Some(first) => {
                if first.display_name.is_empty() {
                    first.display_name = entry.display_name;
                }
                if first.projects.is_empty() {
                    first.projects = entry.projects;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

/// Merge duplicate director/admin rows sharing an email key.
pub fn dedupe_role_entries(entries: Vec<RoleEntry>) -> Vec<RoleEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, RoleEntry> = HashMap::new();

    for entry in entries {
        match merged.get_mut(&entry.email_key) {
            None => {
                order.push(entry.email_key.clone());
                merged.insert(entry.email_key.clone(), entry);
            }
            Some(first) => {
                if first.display_name.is_empty() {
                    first.display_name = entry.display_name;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: Vec<Vec<&str>>) -> Vec<Vec<String>> {
        data.into_iter()
            .map(|r| r.into_iter().map(String::from).collect())
            .collect()
    }

    #[test]
    fn test_header_synonyms_match_after_normalization() {
        let header = rows(vec![vec!["Nombre Completo", "Teléfono de la Madre", "Grupo"]]);
        assert_eq!(header_index(&header[0], NAME_HEADERS), Some(0));
        assert_eq!(header_index(&header[0], MOTHER_PHONE_HEADERS), Some(1));
        assert_eq!(header_index(&header[0], GROUP_HEADERS), Some(2));
    }

    #[test]
    fn test_first_recognized_header_wins() {
        let header = rows(vec![vec!["Nombre", "nombre completo"]]);
        assert_eq!(header_index(&header[0], NAME_HEADERS), Some(0));
    }

    #[test]
    fn test_parse_roster_skips_rows_without_name() {
        let sheet = rows(vec![
            vec!["Nombre", "Grupo", "Tel Madre"],
            vec!["Ana Pérez", "Bet", "099111"],
            vec!["", "Bet", "099222"],
            vec!["", "", ""],
        ]);
        let entries = parse_roster(&sheet);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name_key, "ana perez");
        assert_eq!(entries[0].group_key, "bet");
        assert_eq!(entries[0].mother_phone.as_deref(), Some("099111"));
        assert!(entries[0].father_phone.is_none());
    }

    #[test]
    fn test_parse_staff_normalizes_email() {
        let sheet = rows(vec![
            vec!["Mail", "Nombre", "Grupo"],
            vec![" Dani@X.COM ", "Dani", "Alef"],
        ]);
        let entries = parse_staff(&sheet);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].email_key, "dani@x.com");
        assert_eq!(entries[0].email, "Dani@X.COM");
    }

    #[test]
    fn test_parse_coordinators_splits_project_list() {
        let sheet = rows(vec![
            vec!["Email", "Nombre", "Proyectos"],
            vec!["ana@x.com", "Ana", "Norte, Sur; Centro"],
        ]);
        let entries = parse_coordinators(&sheet);
        assert_eq!(entries[0].projects, vec!["Norte", "Sur", "Centro"]);
    }

    #[test]
    fn test_parse_project_groups() {
        let sheet = rows(vec![
            vec!["Proyecto", "Grupos"],
            vec!["Norte", "Alef, Bet"],
            vec!["Sur", ""],
        ]);
        let entries = parse_project_groups(&sheet);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].groups, vec!["Alef", "Bet"]);
        assert!(entries[1].groups.is_empty());
    }

    #[test]
    fn test_empty_sheet_yields_no_entries() {
        assert!(parse_roster(&[]).is_empty());
        assert!(parse_staff(&rows(vec![vec!["Email"]])).is_empty());
    }

    #[test]
    fn test_dedupe_roster_first_wins_with_field_merge() {
        let entries = vec![
            RosterEntry {
                full_name: "Ana Pérez".into(),
                name_key: "ana perez".into(),
                group: "Bet".into(),
                group_key: "bet".into(),
                mother_phone: Some("099111".into()),
                father_phone: None,
                member_number: None,
                other_groups: vec![],
            },
            RosterEntry {
                full_name: "ANA PEREZ".into(),
                name_key: "ana perez".into(),
                group: "Bet".into(),
                group_key: "bet".into(),
                mother_phone: Some("099999".into()),
                father_phone: Some("098222".into()),
                member_number: Some("41".into()),
                other_groups: vec!["Alef".into()],
            },
        ];
        let merged = dedupe_roster(entries);
        assert_eq!(merged.len(), 1);
        // First value wins
        assert_eq!(merged[0].full_name, "Ana Pérez");
        assert_eq!(merged[0].mother_phone.as_deref(), Some("099111"));
        // Empty fields filled from the duplicate
        assert_eq!(merged[0].father_phone.as_deref(), Some("098222"));
        assert_eq!(merged[0].member_number.as_deref(), Some("41"));
        assert_eq!(merged[0].other_groups, vec!["Alef"]);
    }

    #[test]
    fn test_dedupe_preserves_first_seen_order() {
        let entries = vec![
            RoleEntry {
                email: "b@x.com".into(),
                email_key: "b@x.com".into(),
                display_name: "B".into(),
            },
            RoleEntry {
                email: "a@x.com".into(),
                email_key: "a@x.com".into(),
                display_name: "A".into(),
            },
            RoleEntry {
                email: "B@x.com".into(),
                email_key: "b@x.com".into(),
                display_name: "B dup".into(),
            },
        ];
        let merged = dedupe_role_entries(entries);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].email_key, "b@x.com");
        assert_eq!(merged[1].email_key, "a@x.com");
    }

    #[test]
    fn test_fixture_source_missing_sheet_is_empty() {
        let source = FixtureSource::new();
        assert!(source.read_rows("Janijim").unwrap().is_empty());
    }

    #[test]
    fn test_load_snapshot_from_fixture() {
        let source = FixtureSource::new()
            .with_sheet(
                "Janijim",
                vec![
                    vec!["Nombre", "Grupo"],
                    vec!["Ana Pérez", "Bet"],
                ],
            )
            .with_sheet(
                "Proyectos",
                vec![vec!["Proyecto", "Grupos"], vec!["Norte", "Bet"]],
            );
        let snapshot = load_snapshot(&source, &SheetConfig::default()).unwrap();
        assert_eq!(snapshot.roster.len(), 1);
        assert_eq!(snapshot.project_groups.len(), 1);
        assert!(snapshot.staff.is_empty());
    }
}
