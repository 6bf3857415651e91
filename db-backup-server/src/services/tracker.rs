//! Durable log of every backup and its status.
//!
//! Reads run concurrently on the connection pool. Every write takes the
//! writer lock and runs in its own transaction, so check-then-update
//! sequences are atomic with respect to other writers.

use crate::db::connection::DbPool;
use crate::error::TrackerError;
use crate::models::backup_record::{self, BackupKind, BackupRecord, BackupStatus};
use crate::services::retention;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, PoisonError};

/// Source of "now" for the dependency window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone)]
pub struct Tracker {
    db: DbPool,
    writer: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl Tracker {
    pub fn new(db: DbPool) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            writer: Arc::new(Mutex::new(())),
            clock,
        }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn read<T, F>(&self, f: F) -> Result<T, TrackerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<T, TrackerError> {
            let conn = db.get()?;
            Ok(f(&*conn)?)
        })
        .await?
    }

    async fn write<T, F>(&self, f: F) -> Result<T, TrackerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, TrackerError> + Send + 'static,
    {
        let db = self.db.clone();
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> Result<T, TrackerError> {
            // The guard protects no data, so a poisoned lock is still usable.
            let _guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            let mut conn = db.get()?;
            let tx = conn.transaction()?;
            let out = f(&*tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await?
    }

    /// Record a freshly created backup with status `Created`.
    pub async fn append(
        &self,
        backup_time: DateTime<Utc>,
        kind: BackupKind,
        comment: String,
    ) -> Result<BackupRecord, TrackerError> {
        let backup_time = backup_record::truncate_time(backup_time);
        self.write(move |conn| {
            if backup_record::find_by_time(conn, backup_time)?.is_some() {
                return Err(TrackerError::DuplicateTimestamp(backup_time));
            }
            let id = match backup_record::insert(conn, backup_time, kind, &comment) {
                Ok(id) => id,
                Err(e) if backup_record::is_duplicate_time(&e) => {
                    return Err(TrackerError::DuplicateTimestamp(backup_time));
                }
                Err(e) => return Err(e.into()),
            };
            Ok(BackupRecord {
                id,
                backup_time,
                status: BackupStatus::Created,
                kind,
                comment,
                legacy_dir: None,
            })
        })
        .await
    }

    /// Move a backup forward in its lifecycle. Setting the current status
    /// again is a no-op; moving backwards is rejected.
    pub async fn set_status(&self, backup_time: DateTime<Utc>, status: BackupStatus) -> Result<(), TrackerError> {
        self.write(move |conn| {
            let current = backup_record::find_by_time(conn, backup_time)?
                .ok_or(TrackerError::NotFound(backup_time))?;
            if current.status == status {
                return Ok(());
            }
            if !current.status.can_become(status) {
                return Err(TrackerError::StatusRegression {
                    time: backup_time,
                    from: current.status,
                    to: status,
                });
            }
            backup_record::update_status(conn, backup_time, status)?;
            Ok(())
        })
        .await
    }

    pub async fn find_by_time(&self, backup_time: DateTime<Utc>) -> Result<Option<BackupRecord>, TrackerError> {
        self.read(move |conn| backup_record::find_by_time(conn, backup_time)).await
    }

    /// All records, newest first.
    pub async fn list_all(&self) -> Result<Vec<BackupRecord>, TrackerError> {
        self.read(backup_record::find_all).await
    }

    pub async fn most_recent_full_before(
        &self,
        backup_time: DateTime<Utc>,
    ) -> Result<Option<BackupRecord>, TrackerError> {
        self.read(move |conn| backup_record::latest_full_before(conn, backup_time)).await
    }

    pub async fn next_full_after(&self, backup_time: DateTime<Utc>) -> Result<Option<BackupRecord>, TrackerError> {
        self.read(move |conn| backup_record::next_full_after(conn, backup_time)).await
    }

    pub async fn non_archived_fulls_ascending(&self) -> Result<Vec<BackupRecord>, TrackerError> {
        self.read(backup_record::find_non_archived_fulls).await
    }

    /// Records still waiting for an upload, oldest first.
    pub async fn all_non_uploaded(&self) -> Result<Vec<BackupRecord>, TrackerError> {
        self.read(backup_record::find_pending_uploads).await
    }

    pub async fn incrementals_in_window(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<BackupRecord>, TrackerError> {
        self.read(move |conn| backup_record::find_incrementals_between(conn, after, before))
            .await
    }

    /// Incrementals chained to `full`: everything after it and before the
    /// next full backup, or before now when `full` is the latest.
    pub async fn dependents_of(&self, full: &BackupRecord) -> Result<Vec<BackupRecord>, TrackerError> {
        if !full.is_full() {
            return Ok(Vec::new());
        }
        let full = full.clone();
        let now = self.clock.now();
        self.read(move |conn| {
            // Both queries see the same snapshot
            let tx = conn.unchecked_transaction()?;
            let next = backup_record::next_full_after(&tx, full.backup_time)?;
            let (after, before) = retention::dependency_window(&full, next.as_ref(), now);
            let dependents = backup_record::find_incrementals_between(&tx, after, before)?;
            tx.commit()?;
            Ok(dependents)
        })
        .await
    }
}
