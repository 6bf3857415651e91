//! Fixtures shared by unit tests: a settable clock, a tracker on a scratch
//! database, and in-memory stand-ins for xtrabackup and rclone.

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::models::backup_record::BackupStatus;
use crate::services::tools::{BackupTool, RemoteStorage, ToolError};
use crate::services::tracker::{Clock, Tracker};
use crate::state::AppState;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// 2024-01-01 at `hour:min` UTC.
pub fn t(hour: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, min, 0).unwrap()
}

pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

pub fn open_tracker() -> (TempDir, Tracker, Arc<ManualClock>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = create_pool(&dir.path().join("data.db")).unwrap();
    migrate(&pool).unwrap();
    let clock = Arc::new(ManualClock::new(t(0, 0)));
    let tracker = Tracker::with_clock(pool, clock.clone());
    (dir, tracker, clock)
}

fn tool_failure(program: &str) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        status: "exit status: 1".into(),
        output: "simulated failure".into(),
    }
}

#[derive(Default)]
pub struct FakeBackupTool {
    pub fail: AtomicBool,
    /// How long each backup takes.
    pub delay_ms: AtomicU64,
    calls: Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
}

impl FakeBackupTool {
    pub fn calls(&self) -> Vec<(PathBuf, Option<PathBuf>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackupTool for FakeBackupTool {
    async fn create(&self, target: &Path, base: Option<&Path>) -> Result<(), ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((target.to_path_buf(), base.map(Path::to_path_buf)));
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(tool_failure("xtrabackup"));
        }
        tokio::fs::create_dir_all(target).await.unwrap();
        tokio::fs::write(target.join("xtrabackup_checkpoints"), b"backup_type = full-backuped\n")
            .await
            .unwrap();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRemoteStorage {
    pub fail_uploads: AtomicBool,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    downloads: Mutex<Vec<(String, PathBuf, PathBuf)>>,
}

impl FakeRemoteStorage {
    /// Successful uploads as (local path, remote).
    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<(String, PathBuf, PathBuf)> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStorage for FakeRemoteStorage {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ToolError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(tool_failure("rclone"));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn download(&self, remote: &str, remote_path: &Path, dest: &Path) -> Result<(), ToolError> {
        self.downloads.lock().unwrap().push((
            remote.to_string(),
            remote_path.to_path_buf(),
            dest.to_path_buf(),
        ));
        Ok(())
    }
}

pub struct TestEnv {
    _dir: TempDir,
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub tool: Arc<FakeBackupTool>,
    pub storage: Arc<FakeRemoteStorage>,
}

pub fn test_state() -> TestEnv {
    let (dir, tracker, clock) = open_tracker();
    let config = AppConfig {
        backup_dir: dir.path().join("backups"),
        download_dir: dir.path().join("downloads"),
        db_path: dir.path().join("data.db"),
        upload_max_attempts: 2,
        upload_retry_delay: Duration::from_millis(10),
        ..AppConfig::default()
    };
    std::fs::create_dir_all(&config.backup_dir).unwrap();
    std::fs::create_dir_all(&config.download_dir).unwrap();

    let tool = Arc::new(FakeBackupTool::default());
    let storage = Arc::new(FakeRemoteStorage::default());
    let state = Arc::new(AppState::with_tools(
        config,
        tracker,
        tool.clone(),
        storage.clone(),
    ));
    TestEnv {
        _dir: dir,
        state,
        clock,
        tool,
        storage,
    }
}

/// Poll until the stored record reaches `status`; uploads finish in the background.
pub async fn wait_for_status(state: &AppState, backup_time: DateTime<Utc>, status: BackupStatus) {
    let poll = async {
        loop {
            let current = state.tracker.find_by_time(backup_time).await.unwrap();
            if current.map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("backup at {backup_time} never reached {status}"));
}
