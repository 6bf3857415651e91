use crate::db::connection::DbPool;
use crate::models::backup_record::{format_time, legacy_dir_name, parse_time, BackupKind};
use rusqlite::{params, Connection};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  backup_time TEXT NOT NULL,
  status INTEGER NOT NULL,
  type TEXT NOT NULL,
  comment TEXT,
  legacy_dir TEXT
);
"#;

const INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_backups_backup_time ON backups(backup_time);
CREATE INDEX IF NOT EXISTS idx_backups_type_time ON backups(type, backup_time);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let mut conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Databases created before legacy directory names were kept
    if !has_column(&conn, "backups", "legacy_dir")? {
        conn.execute_batch("ALTER TABLE backups ADD COLUMN legacy_dir TEXT")?;
    }

    // Rows written before times were stored as fixed-width UTC text
    let rewritten = normalize_backup_times(&mut conn)?;
    if rewritten > 0 {
        tracing::info!(rewritten, "[DB] Normalized legacy backup times");
    }

    conn.execute_batch(INDEXES)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}

/// Rewrites every parseable `backup_time` into the canonical format and keeps
/// the directory name the backup was written under. Idempotent; unparseable
/// values are left in place and reported.
fn normalize_backup_times(conn: &mut Connection) -> anyhow::Result<usize> {
    let tx = conn.transaction()?;

    let rows: Vec<(i64, String, String)> = {
        let mut stmt = tx.prepare("SELECT id, backup_time, type FROM backups")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut rewritten = 0;
    for (id, raw, raw_kind) in rows {
        let Some(parsed) = parse_time(&raw) else {
            tracing::warn!(id, backup_time = %raw, "[DB] Unparseable backup time, leaving as is");
            continue;
        };
        let canonical = format_time(parsed);
        if canonical != raw {
            let legacy_dir = BackupKind::parse(&raw_kind).and_then(|kind| legacy_dir_name(&raw, kind));
            if legacy_dir.is_none() {
                tracing::warn!(id, kind = %raw_kind, "[DB] Unknown backup type, legacy directory not recorded");
            }
            tx.execute(
                "UPDATE backups SET backup_time = ?, legacy_dir = ? WHERE id = ?",
                params![canonical, legacy_dir, id],
            )?;
            rewritten += 1;
        }
    }

    tx.commit()?;
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::models::backup_record;

    #[test]
    fn test_migrate_normalizes_legacy_rows_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("data.db")).unwrap();

        {
            let conn = pool.get().unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            conn.execute(
                "INSERT INTO backups (backup_time, status, type, comment) VALUES (?1, 1, 'full', NULL)",
                params!["2024-03-10T08:15:00+08:00"],
            )
            .unwrap();
        }

        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let raw: String = conn
            .query_row("SELECT backup_time FROM backups", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, "2024-03-10T00:15:00.000000Z");

        let records = backup_record::find_all(&conn).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].comment, "");
        assert_eq!(records[0].dir_name(), "db_20240310_0815");
    }

    #[test]
    fn test_adds_legacy_dir_column_to_old_table() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("data.db")).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE backups (
                   id INTEGER PRIMARY KEY AUTOINCREMENT,
                   backup_time TEXT NOT NULL,
                   status INTEGER NOT NULL,
                   type TEXT NOT NULL,
                   comment TEXT
                 );
                 INSERT INTO backups (backup_time, status, type, comment)
                   VALUES ('2024-03-10T09:30:00+08:00', 0, 'incremental', 'legacy');",
            )
            .unwrap();

        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        assert!(has_column(&conn, "backups", "legacy_dir").unwrap());
        let records = backup_record::find_all(&conn).unwrap();
        assert_eq!(records[0].legacy_dir.as_deref(), Some("db_20240310_0930_inc"));
    }

    #[test]
    fn test_unique_index_rejects_duplicate_times() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("data.db")).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let t = parse_time("2024-03-10T00:00:00Z").unwrap();
        backup_record::insert(&conn, t, backup_record::BackupKind::Full, "first").unwrap();
        let err = backup_record::insert(&conn, t, backup_record::BackupKind::Full, "second").unwrap_err();
        assert!(backup_record::is_duplicate_time(&err));
    }
}
