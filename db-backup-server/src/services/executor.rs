//! High-level backup operations: create and track backups, clean up old
//! ones, and push pending copies to remote storage.

use crate::error::BackupError;
use crate::models::backup_record::{self, BackupKind, BackupRecord, BackupStatus};
use crate::services::retention;
use crate::services::transfers::{self, UploadJob};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path};
use std::time::Duration;

const TRACK_ATTEMPTS: u32 = 3;
const TRACK_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    /// Full backups archived together with their incrementals.
    pub archived: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub failed: usize,
}

/// Strictly after the previous anchor, so backup times never collide.
fn next_anchor(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = backup_record::truncate_time(now);
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

fn resolve_remote<'a>(remote: Option<&'a str>, default: &'a str) -> &'a str {
    match remote {
        Some(r) if !r.trim().is_empty() => r,
        _ => default,
    }
}

/// Create a backup, track it, and hand the upload to the transfer dispatcher.
///
/// Returns once the backup is tracked; the upload finishes in the background.
pub async fn perform_backup(
    state: &AppState,
    kind: BackupKind,
    remote: Option<&str>,
    comment: &str,
) -> Result<BackupRecord, BackupError> {
    // Creation is serialized; the guard holds the last anchor handed out.
    let mut last_anchor = state.last_anchor.lock().await;
    let backup_time = next_anchor(*last_anchor, state.tracker.now());
    *last_anchor = Some(backup_time);

    let backup_root = &state.config.backup_dir;
    let base = match kind {
        BackupKind::Full => None,
        BackupKind::Incremental => Some(
            state
                .tracker
                .most_recent_full_before(backup_time)
                .await?
                .ok_or(BackupError::NoBaseBackup)?,
        ),
    };

    let target = backup_record::local_path(backup_root, backup_time, kind);
    if tokio::fs::try_exists(&target).await.unwrap_or(true) {
        return Err(BackupError::TargetExists(target));
    }
    let base_path = base.as_ref().map(|b| b.local_path(backup_root));

    match &base {
        Some(parent) => tracing::info!(
            backup = %target.display(),
            base = %parent.dir_name(),
            "Creating incremental backup"
        ),
        None => tracing::info!(backup = %target.display(), "Creating full backup"),
    }

    if let Err(e) = state.backup_tool.create(&target, base_path.as_deref()).await {
        tracing::error!(backup = %target.display(), error = %e, "Backup creation failed");
        return Err(BackupError::CreationFailed(e));
    }

    let record = track_created_backup(state, backup_time, kind, comment, &target).await?;
    drop(last_anchor);
    tracing::info!(backup = %record.dir_name(), kind = %kind, "Backup created successfully");

    let remote = resolve_remote(remote, &state.config.default_rclone_remote).to_string();
    state.transfers.spawn_upload(
        state.tracker.clone(),
        state.remote_storage.clone(),
        UploadJob {
            record: record.clone(),
            local: target,
            remote,
        },
    );

    state.timers.for_backup(kind).reset();
    Ok(record)
}

/// Track a backup that already exists on disk. Transient store errors are
/// retried; if tracking still fails the directory is removed again so no
/// untracked backup is left behind.
async fn track_created_backup(
    state: &AppState,
    backup_time: DateTime<Utc>,
    kind: BackupKind,
    comment: &str,
    target: &Path,
) -> Result<BackupRecord, BackupError> {
    let mut attempt = 1;
    let error = loop {
        match state.tracker.append(backup_time, kind, comment.to_string()).await {
            Ok(record) => return Ok(record),
            Err(e) if e.is_transient() && attempt < TRACK_ATTEMPTS => {
                tracing::warn!(backup = %target.display(), attempt, error = %e, "Tracking failed, retrying");
                tokio::time::sleep(TRACK_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => break e,
        }
    };

    tracing::error!(backup = %target.display(), error = %error, "Tracking failed, rolling back backup");
    if let Err(e) = tokio::fs::remove_dir_all(target).await {
        tracing::error!(backup = %target.display(), error = %e, "Rollback failed, backup left untracked");
    }
    Err(BackupError::TrackingFailed {
        path: target.to_path_buf(),
        source: error,
    })
}

/// Delete a backup's local files and archive it. A full backup takes its
/// dependent incrementals with it.
///
/// The full backup is archived last: if the cascade stops partway it stays
/// a cleanup candidate and the remaining incrementals are retried next pass.
pub async fn delete_local_backup(state: &AppState, record: &BackupRecord) -> Result<(), BackupError> {
    remove_local_files(state, record).await?;

    if record.is_full() {
        let dependents = state.tracker.dependents_of(record).await?;
        for incremental in &dependents {
            if incremental.status == BackupStatus::Archived {
                continue;
            }
            remove_local_files(state, incremental).await?;
            state
                .tracker
                .set_status(incremental.backup_time, BackupStatus::Archived)
                .await?;
            tracing::info!(backup = %incremental.dir_name(), "Deleted local incremental backup");
        }
    }

    state
        .tracker
        .set_status(record.backup_time, BackupStatus::Archived)
        .await?;
    tracing::info!(backup = %record.dir_name(), "Deleted local backup");
    Ok(())
}

/// A directory that is already gone counts as deleted.
async fn remove_local_files(state: &AppState, record: &BackupRecord) -> Result<(), BackupError> {
    let path = record.local_path(&state.config.backup_dir);
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(backup = %path.display(), "Local backup already removed");
            Ok(())
        }
        Err(source) => Err(BackupError::DeletionFailed { path, source }),
    }
}

/// One cleanup pass: archive every full backup beyond the retention count.
pub async fn run_cleanup(state: &AppState) -> Result<CleanupSummary, BackupError> {
    let fulls = state.tracker.non_archived_fulls_ascending().await?;
    let expired = retention::select_for_deletion(&fulls, state.config.local_backup_count);

    let mut summary = CleanupSummary::default();
    for record in expired {
        match delete_local_backup(state, record).await {
            Ok(()) => summary.archived += 1,
            Err(e) => {
                tracing::error!(backup = %record.dir_name(), error = %e, "Failed to delete local backup");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Upload every backup still waiting for it to the default remote.
pub async fn run_remote_sync(state: &AppState) -> Result<SyncSummary, BackupError> {
    let pending = state.tracker.all_non_uploaded().await?;
    let remote = &state.config.default_rclone_remote;

    let mut summary = SyncSummary::default();
    for record in &pending {
        let local = record.local_path(&state.config.backup_dir);
        if !tokio::fs::try_exists(&local).await.unwrap_or(false) {
            tracing::warn!(backup = %record.dir_name(), path = %local.display(), "Local backup missing, skipping upload");
            summary.failed += 1;
            continue;
        }
        match state.remote_storage.upload(&local, remote).await {
            Ok(()) => {
                if transfers::mark_uploaded(&state.tracker, record).await {
                    summary.uploaded += 1;
                } else {
                    summary.failed += 1;
                }
            }
            Err(e) => {
                let e = BackupError::UploadFailed(e);
                tracing::error!(backup = %record.dir_name(), error = %e, "Failed to upload backup");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Start fetching `backup_name` from `remote` into the download directory.
pub fn download_backup(state: &AppState, remote: Option<&str>, backup_name: &str) -> Result<(), BackupError> {
    if !is_plain_name(backup_name) {
        return Err(BackupError::InvalidBackupName(backup_name.to_string()));
    }

    let remote = resolve_remote(remote, &state.config.default_rclone_remote).to_string();
    let queued = state.transfers.spawn_download(
        state.remote_storage.clone(),
        remote,
        state.config.backup_dir.join(backup_name),
        state.config.download_dir.join(backup_name),
    );
    if !queued {
        return Err(BackupError::ShuttingDown);
    }
    Ok(())
}

/// A single normal path component.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}
