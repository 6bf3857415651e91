use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Fixed-width UTC text, so ordering the column as text is chronological.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const DIR_TIME_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// Minute-precision local-time stamp of directories created before
/// sub-second names were introduced.
const LEGACY_DIR_TIME_FORMAT: &str = "%Y%m%d_%H%M";

const COLUMNS: &str = "id, backup_time, status, type, comment, legacy_dir";

// ── Status ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Saved locally, waiting to be uploaded.
    Created = 0,
    /// Copied to remote storage.
    Uploaded = 1,
    /// Local files deleted; only the remote copy (if any) survives.
    Archived = 2,
}

impl BackupStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::Uploaded),
            2 => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Status only moves forward. Staying put is allowed.
    pub fn can_become(self, next: BackupStatus) -> bool {
        next >= self
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Uploaded => "uploaded",
            Self::Archived => "archived",
        })
    }
}

// ── Kind ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── BackupRecord ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub id: i64,
    pub backup_time: DateTime<Utc>,
    pub status: BackupStatus,
    pub kind: BackupKind,
    pub comment: String,
    /// Directory name of a backup created under the legacy naming scheme.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_dir: Option<String>,
}

impl BackupRecord {
    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }

    pub fn dir_name(&self) -> String {
        match &self.legacy_dir {
            Some(name) => name.clone(),
            None => dir_name(self.backup_time, self.kind),
        }
    }

    pub fn local_path(&self, backup_root: &Path) -> PathBuf {
        backup_root.join(self.dir_name())
    }
}

/// `db_<time>` for full backups, `db_<time>_inc` for incrementals.
pub fn dir_name(backup_time: DateTime<Utc>, kind: BackupKind) -> String {
    let stamp = backup_time.format(DIR_TIME_FORMAT);
    match kind {
        BackupKind::Full => format!("db_{stamp}"),
        BackupKind::Incremental => format!("db_{stamp}_inc"),
    }
}

/// Directory name a legacy row's backup was written under: the stored
/// timestamp in its own UTC offset, to the minute.
pub fn legacy_dir_name(raw_time: &str, kind: BackupKind) -> Option<String> {
    let local = DateTime::parse_from_rfc3339(raw_time).ok()?;
    let stamp = local.format(LEGACY_DIR_TIME_FORMAT);
    Some(match kind {
        BackupKind::Full => format!("db_{stamp}"),
        BackupKind::Incremental => format!("db_{stamp}_inc"),
    })
}

pub fn local_path(backup_root: &Path, backup_time: DateTime<Utc>, kind: BackupKind) -> PathBuf {
    backup_root.join(dir_name(backup_time, kind))
}

/// Backup times are stored with microsecond precision.
pub fn truncate_time(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let raw_time: String = row.get("backup_time")?;
    let backup_time = parse_time(&raw_time)
        .ok_or_else(|| conversion_error(1, format!("invalid backup_time {raw_time:?}")))?;

    let raw_status: i64 = row.get("status")?;
    let status = BackupStatus::from_i64(raw_status)
        .ok_or_else(|| conversion_error(2, format!("invalid status {raw_status}")))?;

    let raw_kind: String = row.get("type")?;
    let kind = BackupKind::parse(&raw_kind)
        .ok_or_else(|| conversion_error(3, format!("invalid type {raw_kind:?}")))?;

    let comment: Option<String> = row.get("comment")?;
    let legacy_dir: Option<String> = row.get("legacy_dir")?;

    Ok(BackupRecord {
        id: row.get("id")?,
        backup_time,
        status,
        kind,
        comment: comment.unwrap_or_default(),
        legacy_dir,
    })
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> rusqlite::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_record)?;
    rows.collect()
}

fn query_record(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> rusqlite::Result<Option<BackupRecord>> {
    conn.query_row(sql, args, row_to_record).optional()
}

pub fn find_all(conn: &Connection) -> rusqlite::Result<Vec<BackupRecord>> {
    query_records(
        conn,
        &format!("SELECT {COLUMNS} FROM backups ORDER BY backup_time DESC"),
        [],
    )
}

pub fn find_by_time(conn: &Connection, backup_time: DateTime<Utc>) -> rusqlite::Result<Option<BackupRecord>> {
    query_record(
        conn,
        &format!("SELECT {COLUMNS} FROM backups WHERE backup_time = ?"),
        params![format_time(backup_time)],
    )
}

pub fn latest_full_before(conn: &Connection, backup_time: DateTime<Utc>) -> rusqlite::Result<Option<BackupRecord>> {
    query_record(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM backups WHERE type = 'full' AND backup_time < ?
             ORDER BY backup_time DESC LIMIT 1"
        ),
        params![format_time(backup_time)],
    )
}

pub fn next_full_after(conn: &Connection, backup_time: DateTime<Utc>) -> rusqlite::Result<Option<BackupRecord>> {
    query_record(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM backups WHERE type = 'full' AND backup_time > ?
             ORDER BY backup_time ASC LIMIT 1"
        ),
        params![format_time(backup_time)],
    )
}

pub fn find_non_archived_fulls(conn: &Connection) -> rusqlite::Result<Vec<BackupRecord>> {
    query_records(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM backups WHERE type = 'full' AND status != ?
             ORDER BY backup_time ASC"
        ),
        params![BackupStatus::Archived.as_i64()],
    )
}

pub fn find_pending_uploads(conn: &Connection) -> rusqlite::Result<Vec<BackupRecord>> {
    query_records(
        conn,
        &format!("SELECT {COLUMNS} FROM backups WHERE status = ? ORDER BY backup_time ASC"),
        params![BackupStatus::Created.as_i64()],
    )
}

/// Incrementals strictly inside `(after, before)`.
pub fn find_incrementals_between(
    conn: &Connection,
    after: DateTime<Utc>,
    before: DateTime<Utc>,
) -> rusqlite::Result<Vec<BackupRecord>> {
    query_records(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM backups
             WHERE type = 'incremental' AND backup_time > ? AND backup_time < ?
             ORDER BY backup_time ASC"
        ),
        params![format_time(after), format_time(before)],
    )
}

pub fn insert(
    conn: &Connection,
    backup_time: DateTime<Utc>,
    kind: BackupKind,
    comment: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO backups (backup_time, status, type, comment) VALUES (?1, ?2, ?3, ?4)",
        params![
            format_time(backup_time),
            BackupStatus::Created.as_i64(),
            kind.as_str(),
            comment
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_status(conn: &Connection, backup_time: DateTime<Utc>, status: BackupStatus) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE backups SET status = ? WHERE backup_time = ?",
        params![status.as_i64(), format_time(backup_time)],
    )
}

/// True when `err` is the unique index on `backup_time` rejecting an insert.
pub fn is_duplicate_time(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
