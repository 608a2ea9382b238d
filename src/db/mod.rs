//! SQLite-backed relational store for the reconciliation engine.
//!
//! The database lives at `~/.kensync/kensync.db`. Rows managed by the sync
//! engine are deactivated rather than deleted — inactive rows are retained for
//! history, and a later sheet can reactivate them.

use std::path::PathBuf;

use rusqlite::Connection;

mod migrations;
pub mod groups;
pub mod members;
pub mod projects;
pub mod roles;
pub mod roster;
pub mod runs;
pub mod snapshot;
pub mod types;

pub use snapshot::StoreSnapshot;
pub use types::*;

pub struct SyncDb {
    conn: Connection,
}

impl SyncDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| DbError::Transaction(format!("begin: {}", e)))?;
        match f(self) {
            Ok(val) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| DbError::Transaction(format!("commit: {}", e)))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.kensync/kensync.db` and apply
    /// pending migrations.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database with the full schema. Test-only convenience.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.kensync/kensync.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".kensync").join("kensync.db"))
    }

    /// Whether the roster-extras side table exists in this database.
    ///
    /// Deployments still on the baseline schema lack it; the engine then
    /// degrades to "no extras" instead of failing. Resolved once per snapshot
    /// load, never by sniffing error strings.
    pub fn has_roster_extras(&self) -> Result<bool, DbError> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'roster_extra_groups'")?
            .exists([])?;
        Ok(exists)
    }
}
