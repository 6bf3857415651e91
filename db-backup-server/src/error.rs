use crate::models::backup_record::BackupStatus;
use crate::services::tools::ToolError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::PathBuf;

/// Failures of the backup record store.
#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("a backup is already recorded at {0}")]
    DuplicateTimestamp(DateTime<Utc>),

    #[error("no backup recorded at {0}")]
    NotFound(DateTime<Utc>),

    #[error("backup {time} cannot go from {from} back to {to}")]
    StatusRegression {
        time: DateTime<Utc>,
        from: BackupStatus,
        to: BackupStatus,
    },

    #[error("stored record is invalid: {0}")]
    InvalidRecord(String),

    #[error(transparent)]
    Database(rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error("tracker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<rusqlite::Error> for TrackerError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(_, _, source) => Self::InvalidRecord(source.to_string()),
            e => Self::Database(e),
        }
    }
}

impl TrackerError {
    /// Errors worth retrying, as opposed to invariant violations.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Pool(_) | Self::Task(_))
    }
}

/// Failures of backup, cleanup and transfer operations.
#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("no full backup exists to base an incremental backup on")]
    NoBaseBackup,

    #[error("backup directory {} already exists", .0.display())]
    TargetExists(PathBuf),

    #[error("backup creation failed: {0}")]
    CreationFailed(ToolError),

    #[error("backup {} was created but could not be tracked: {source}", .path.display())]
    TrackingFailed { path: PathBuf, source: TrackerError },

    #[error("upload failed: {0}")]
    UploadFailed(ToolError),

    #[error("failed to delete local backup {}: {source}", .path.display())]
    DeletionFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid backup name {0:?}")]
    InvalidBackupName(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] TrackerError),
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<TrackerError> for AppError {
    fn from(e: TrackerError) -> Self {
        AppError::Backup(BackupError::Store(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Backup(BackupError::InvalidBackupName(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Backup(BackupError::ShuttingDown) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::Backup(e) => {
                tracing::error!(error = %e, "Backup operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
