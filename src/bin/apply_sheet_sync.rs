//! One-shot administrative sheet sync.
//!
//! Reads the institutional workbook, reconciles it against the store, and
//! applies the result immediately — the programmatic equivalent of the UI's
//! "apply now" action, bypassing the run store. Authorization is the
//! operator's: this tool runs with whatever database it is pointed at.
//!
//! Usage: `apply_sheet_sync <workbook.xlsx> [db-path]`
//! With no db path, the default store at `~/.kensync/kensync.db` is used.

use std::path::PathBuf;
use std::process::ExitCode;

use kensync::db::SyncDb;
use kensync::sheet::{is_workbook_path, load_snapshot, SheetConfig, WorkbookSource};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(workbook) = args.next().map(PathBuf::from) else {
        eprintln!("Usage: apply_sheet_sync <workbook.xlsx> [db-path]");
        return ExitCode::FAILURE;
    };
    if !is_workbook_path(&workbook) {
        eprintln!(
            "{} does not look like a workbook (.xlsx/.xls/.xlsb/.ods)",
            workbook.display()
        );
        return ExitCode::FAILURE;
    }

    let db = match args.next().map(PathBuf::from) {
        Some(path) => SyncDb::open_at(path),
        None => SyncDb::open(),
    };
    let db = match db {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database: {e}");
            return ExitCode::FAILURE;
        }
    };

    let source = WorkbookSource::new(&workbook);
    let sheet = match load_snapshot(&source, &SheetConfig::default()) {
        Ok(sheet) => sheet,
        Err(e) => {
            eprintln!("Failed to read workbook: {e}");
            return ExitCode::FAILURE;
        }
    };

    match kensync::apply_direct(&db, &sheet) {
        Ok(report) => {
            let summary = &report.preview.summary;
            log::info!(
                "applied: {} groups ({} new), {} orphan groups, roster +{} ~{} -{}",
                report.result.groups_processed,
                report.result.groups_created,
                report.result.orphan_groups_processed,
                summary.roster.insert,
                summary.roster.update,
                summary.roster.deactivate,
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&report.result)
                    .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Sync failed: {e}");
            ExitCode::FAILURE
        }
    }
}
