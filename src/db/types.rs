//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),
}

/// A row from the `app_groups` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbGroup {
    pub id: String,
    pub name: String,
    pub name_key: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `app_projects` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProject {
    pub id: String,
    pub name: String,
    pub name_key: String,
    /// Pre-association single-group linkage; nulled once a `group_projects`
    /// row exists for the project.
    pub legacy_group_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `person_profiles` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPersonProfile {
    pub email_key: String,
    pub email: String,
    pub display_name: String,
    pub updated_at: String,
}

/// A stored group-membership row. Unique per (group, normalized email).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbGroupMember {
    pub id: String,
    pub group_id: String,
    pub email: String,
    pub email_key: String,
    pub display_name: String,
    pub role: String,
    pub active: bool,
    pub invited: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored roster row. Unique per (group, normalized full name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRosterRow {
    pub id: String,
    pub group_id: String,
    pub project_id: Option<String>,
    pub full_name: String,
    pub name_key: String,
    pub mother_phone: Option<String>,
    pub father_phone: Option<String>,
    pub member_number: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from `app_roles`. Unique per (normalized email, role).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRoleGrant {
    pub id: String,
    pub email: String,
    pub email_key: String,
    pub role: String,
    pub display_name: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `sync_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSyncRun {
    pub id: String,
    pub operator_id: String,
    pub status: String,
    pub preview_json: String,
    pub preview_hash: String,
    pub summary_json: String,
    pub result_json: Option<String>,
    pub error_note: Option<String>,
    pub created_at: String,
    pub committed_at: Option<String>,
}
