//! Daily copy of the tracking database, next to it under `db_backups/`.

use crate::db::connection::DbPool;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

const MAX_COPIES: usize = 7;
const COPY_PREFIX: &str = "tracker-";

fn copy_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("db_backups")
}

/// Snapshot the database for `today` unless that copy already exists, then
/// prune all but the newest copies.
pub fn backup_database(pool: &DbPool, db_path: &Path, today: NaiveDate) -> anyhow::Result<Option<PathBuf>> {
    let dir = copy_dir(db_path);
    std::fs::create_dir_all(&dir)?;

    let copy_path = dir.join(format!("{COPY_PREFIX}{}.db", today.format("%Y-%m-%d")));
    let created = if copy_path.exists() {
        tracing::info!(copy = %copy_path.display(), "Today's database copy already exists, skipping");
        None
    } else {
        // VACUUM INTO writes a consistent copy even while other connections are open
        let conn = pool.get()?;
        conn.execute("VACUUM INTO ?1", [copy_path.to_string_lossy().into_owned()])?;
        tracing::info!(copy = %copy_path.display(), "Created database copy");
        Some(copy_path)
    };

    prune_copies(&dir)?;
    Ok(created)
}

fn prune_copies(dir: &Path) -> anyhow::Result<()> {
    let mut copies: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(COPY_PREFIX))
        .collect();

    // Dated names sort chronologically; newest first
    copies.sort_by_key(|e| std::cmp::Reverse(e.file_name()));

    for old in copies.into_iter().skip(MAX_COPIES) {
        match std::fs::remove_file(old.path()) {
            Ok(()) => tracing::info!(copy = %old.path().display(), "Removed old database copy"),
            Err(e) => tracing::warn!(copy = %old.path().display(), error = %e, "Failed to remove old database copy"),
        }
    }
    Ok(())
}
