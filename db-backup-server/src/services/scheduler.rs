//! Four independent periodic jobs: full backup, incremental backup,
//! cleanup and remote sync.
//!
//! Each loop runs its job to completion before rearming, so a job never
//! overlaps itself. A reset pushes the next tick a full interval past the
//! moment it is applied; the backup executor resets its kind's timer after
//! every successful run, manual or scheduled.

use crate::config::AppConfig;
use crate::models::backup_record::BackupKind;
use crate::services::executor;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullBackup,
    IncrementalBackup,
    Cleanup,
    RemoteSync,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::FullBackup,
        JobKind::IncrementalBackup,
        JobKind::Cleanup,
        JobKind::RemoteSync,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::FullBackup => "full_backup",
            JobKind::IncrementalBackup => "incremental_backup",
            JobKind::Cleanup => "cleanup",
            JobKind::RemoteSync => "remote_sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub interval_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

pub struct JobTimer {
    kind: JobKind,
    period: Duration,
    reset: Notify,
    status: watch::Sender<JobStatus>,
}

impl JobTimer {
    pub fn new(kind: JobKind, period: Duration) -> Self {
        let (status, _) = watch::channel(JobStatus {
            state: JobState::Idle,
            interval_secs: period.as_secs(),
            last_run_at: None,
        });
        Self {
            kind,
            period,
            reset: Notify::new(),
            status,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Restart the countdown from now. Applied once the job is idle.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    #[cfg(test)]
    pub(crate) async fn reset_notified(&self) {
        self.reset.notified().await;
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    fn mark_running(&self) {
        self.status.send_modify(|s| s.state = JobState::Running);
    }

    fn mark_idle(&self) {
        self.status.send_modify(|s| {
            s.state = JobState::Idle;
            s.last_run_at = Some(Utc::now());
        });
    }
}

pub struct JobTimers {
    pub full_backup: Arc<JobTimer>,
    pub incremental_backup: Arc<JobTimer>,
    pub cleanup: Arc<JobTimer>,
    pub remote_sync: Arc<JobTimer>,
}

impl JobTimers {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            full_backup: Arc::new(JobTimer::new(JobKind::FullBackup, config.full_backup_interval)),
            incremental_backup: Arc::new(JobTimer::new(
                JobKind::IncrementalBackup,
                config.incremental_backup_interval,
            )),
            cleanup: Arc::new(JobTimer::new(JobKind::Cleanup, config.cleanup_interval)),
            remote_sync: Arc::new(JobTimer::new(JobKind::RemoteSync, config.rclone_upload_interval)),
        }
    }

    pub fn get(&self, kind: JobKind) -> &Arc<JobTimer> {
        match kind {
            JobKind::FullBackup => &self.full_backup,
            JobKind::IncrementalBackup => &self.incremental_backup,
            JobKind::Cleanup => &self.cleanup,
            JobKind::RemoteSync => &self.remote_sync,
        }
    }

    pub fn for_backup(&self, kind: BackupKind) -> &Arc<JobTimer> {
        match kind {
            BackupKind::Full => &self.full_backup,
            BackupKind::Incremental => &self.incremental_backup,
        }
    }
}

pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Spawn one loop per job. Loops stop when `cancel` fires.
    pub fn start(state: Arc<AppState>, cancel: CancellationToken) -> Self {
        let handles = JobKind::ALL
            .into_iter()
            .map(|kind| {
                let timer = state.timers.get(kind).clone();
                let state = state.clone();
                tracing::info!(job = kind.name(), interval = ?timer.period(), "Job scheduled");
                tokio::spawn(run_timer(timer, cancel.clone(), move || {
                    let state = state.clone();
                    async move { run_job(&state, kind).await }
                }))
            })
            .collect();

        Self { handles, cancel }
    }

    /// Halt all loops. A job still running gets `grace` to finish.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for handle in self.handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("Scheduled job did not finish in time, aborting");
                abort.abort();
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Timer loop for one job. The first run is one period after start.
pub async fn run_timer<F, Fut>(timer: Arc<JobTimer>, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let period = timer.period();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = timer.reset.notified() => {
                interval.reset();
                tracing::debug!(job = timer.kind().name(), "Timer reset");
            }
            _ = interval.tick() => {
                timer.mark_running();
                job().await;
                timer.mark_idle();
            }
        }
    }

    tracing::info!(job = timer.kind().name(), "Job loop stopped");
}

async fn run_job(state: &AppState, kind: JobKind) {
    match kind {
        JobKind::FullBackup => {
            tracing::info!("Starting scheduled full backup...");
            match executor::perform_backup(state, BackupKind::Full, None, "Scheduled full backup").await {
                Ok(record) => tracing::info!(backup = %record.dir_name(), "Scheduled full backup completed successfully"),
                Err(e) => tracing::error!(error = %e, "Scheduled full backup failed"),
            }
        }
        JobKind::IncrementalBackup => {
            tracing::info!("Starting scheduled incremental backup...");
            match executor::perform_backup(
                state,
                BackupKind::Incremental,
                None,
                "Scheduled incremental backup",
            )
            .await
            {
                Ok(record) => tracing::info!(backup = %record.dir_name(), "Scheduled incremental backup completed successfully"),
                Err(e) => tracing::error!(error = %e, "Scheduled incremental backup failed"),
            }
        }
        JobKind::Cleanup => {
            tracing::info!("Starting scheduled cleanup of old backups...");
            match executor::run_cleanup(state).await {
                Ok(summary) => tracing::info!(
                    archived = summary.archived,
                    failed = summary.failed,
                    "Scheduled cleanup finished"
                ),
                Err(e) => tracing::error!(error = %e, "Scheduled cleanup failed"),
            }
        }
        JobKind::RemoteSync => {
            tracing::info!("Starting scheduled upload of pending backups...");
            match executor::run_remote_sync(state).await {
                Ok(summary) => tracing::info!(
                    uploaded = summary.uploaded,
                    failed = summary.failed,
                    "Scheduled remote sync finished"
                ),
                Err(e) => tracing::error!(error = %e, "Scheduled remote sync failed"),
            }
        }
    }
}
