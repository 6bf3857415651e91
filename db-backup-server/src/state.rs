use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::services::scheduler::JobTimers;
use crate::services::tools::{BackupTool, Rclone, RemoteStorage, Xtrabackup};
use crate::services::tracker::Tracker;
use crate::services::transfers::{RetryPolicy, TransferDispatcher};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct AppState {
    pub config: AppConfig,
    pub tracker: Tracker,
    pub backup_tool: Arc<dyn BackupTool>,
    pub remote_storage: Arc<dyn RemoteStorage>,
    pub timers: JobTimers,
    pub transfers: TransferDispatcher,
    /// Held for the whole create-and-track step; the last backup time handed out.
    pub last_anchor: Mutex<Option<DateTime<Utc>>>,
}

impl AppState {
    /// State backed by the real xtrabackup and rclone binaries.
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        let tool = Arc::new(Xtrabackup::from_config(&config));
        let storage = Arc::new(Rclone::from_config(&config));
        Self::with_tools(config, Tracker::new(db), tool, storage)
    }

    pub fn with_tools(
        config: AppConfig,
        tracker: Tracker,
        backup_tool: Arc<dyn BackupTool>,
        remote_storage: Arc<dyn RemoteStorage>,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.upload_max_attempts,
            base_delay: config.upload_retry_delay,
        };
        Self {
            timers: JobTimers::from_config(&config),
            transfers: TransferDispatcher::new(config.max_concurrent_transfers, retry),
            tracker,
            backup_tool,
            remote_storage,
            last_anchor: Mutex::new(None),
            config,
        }
    }
}
