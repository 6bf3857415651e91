use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    // Per-connection pragmas
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = DELETE;")?;

    Ok(pool)
}

/// Refresh query planner statistics before exit. Connections close when the
/// pool is dropped.
pub fn close_pool(pool: &DbPool) {
    match pool.get() {
        Ok(conn) => {
            if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
                tracing::warn!(error = %e, "[DB] Optimize on close failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "[DB] No connection available on close"),
    }
}
