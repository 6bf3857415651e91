//! Background uploads and downloads.
//!
//! Every transfer is a task on one `TaskTracker`, bounded by a semaphore.
//! Failed uploads retry with exponential backoff; once attempts run out the
//! record stays `Created` and the periodic remote-sync job picks it up.

use crate::error::TrackerError;
use crate::models::backup_record::{BackupRecord, BackupStatus};
use crate::services::tools::RemoteStorage;
use crate::services::tracker::Tracker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base, 2×base, 4×base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

pub struct UploadJob {
    pub record: BackupRecord,
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Clone)]
pub struct TransferDispatcher {
    tasks: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl TransferDispatcher {
    pub fn new(max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
        }
    }

    /// Transfers queued or running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn spawn_upload(&self, tracker: Tracker, storage: Arc<dyn RemoteStorage>, job: UploadJob) {
        if self.tasks.is_closed() {
            tracing::warn!(
                backup = %job.record.dir_name(),
                "Shutting down, upload left for the next remote sync"
            );
            return;
        }

        let cancel = self.cancel.clone();
        let permits = self.permits.clone();
        let retry = self.retry;
        self.tasks.spawn(async move {
            let backup = job.record.dir_name();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(backup = %backup, "Upload interrupted by shutdown");
                }
                _ = upload_with_retry(tracker, storage, job, permits, retry, cancel.clone()) => {}
            }
        });
    }

    /// Queue a download. Returns false once shutdown has started.
    pub fn spawn_download(
        &self,
        storage: Arc<dyn RemoteStorage>,
        remote: String,
        remote_path: PathBuf,
        dest: PathBuf,
    ) -> bool {
        if self.tasks.is_closed() {
            tracing::warn!(path = %remote_path.display(), "Shutting down, download refused");
            return false;
        }

        let cancel = self.cancel.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            tracing::info!(remote = %remote, path = %remote_path.display(), "Downloading backup");
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(path = %remote_path.display(), "Download interrupted by shutdown");
                }
                result = storage.download(&remote, &remote_path, &dest) => match result {
                    Ok(()) => tracing::info!(
                        dest = %dest.display(),
                        "Download completed successfully"
                    ),
                    Err(e) => tracing::error!(
                        path = %remote_path.display(),
                        error = %e,
                        "Download failed"
                    ),
                },
            }
        });
        true
    }

    /// Stop accepting transfers, give in-flight ones `grace` to finish, then
    /// interrupt whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(remaining = self.tasks.len(), "Interrupting unfinished transfers");
            self.cancel.cancel();
            self.tasks.wait().await;
        }
    }
}

async fn upload_with_retry(
    tracker: Tracker,
    storage: Arc<dyn RemoteStorage>,
    job: UploadJob,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    let backup = job.record.dir_name();
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };

    for attempt in 1..=retry.max_attempts {
        tracing::info!(backup = %backup, remote = %job.remote, attempt, "Uploading backup");
        match storage.upload(&job.local, &job.remote).await {
            Ok(()) => {
                mark_uploaded(&tracker, &job.record).await;
                return;
            }
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.delay_after(attempt);
                tracing::warn!(
                    backup = %backup,
                    attempt,
                    retry_in = ?delay,
                    error = %e,
                    "Upload failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!(
                    backup = %backup,
                    attempts = attempt,
                    error = %e,
                    "Upload failed, leaving it for the next remote sync"
                );
            }
        }
    }
}

/// Record a finished upload. Cleanup may already have archived the record,
/// which is not an error.
pub async fn mark_uploaded(tracker: &Tracker, record: &BackupRecord) -> bool {
    match tracker.set_status(record.backup_time, BackupStatus::Uploaded).await {
        Ok(()) => {
            tracing::info!(backup = %record.dir_name(), "Backup uploaded successfully");
            true
        }
        Err(TrackerError::StatusRegression { from, .. }) => {
            tracing::debug!(backup = %record.dir_name(), status = %from, "Upload finished after archival");
            true
        }
        Err(e) => {
            tracing::error!(backup = %record.dir_name(), error = %e, "Failed to record upload");
            false
        }
    }
}
