use crate::error::AppError;
use crate::models::backup_record::{BackupKind, BackupRecord};
use crate::services::executor;
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct TriggerBackupRequest {
    pub drive: Option<String>,
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub drive: Option<String>,
    pub backup_name: String,
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(b)| b)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

/// Runs the backup on its own task: a client that disconnects must not
/// cancel it between creation and tracking.
async fn trigger(
    state: Arc<AppState>,
    kind: BackupKind,
    body: TriggerBackupRequest,
    default_comment: &str,
) -> Result<StatusCode, AppError> {
    let comment = body
        .comment
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| default_comment.to_string());
    let remote = body.drive;

    tokio::spawn(async move { executor::perform_backup(&state, kind, remote.as_deref(), &comment).await })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /full
pub async fn trigger_full(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TriggerBackupRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let body = parse_body(body)?;
    tracing::info!("Manual full backup requested");
    trigger(state, BackupKind::Full, body, "Manual full backup").await
}

/// POST /incremental
pub async fn trigger_incremental(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TriggerBackupRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let body = parse_body(body)?;
    tracing::info!("Manual incremental backup requested");
    trigger(state, BackupKind::Incremental, body, "Manual incremental backup").await
}

/// POST /download. Returns once the download is queued.
pub async fn trigger_download(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let body = parse_body(body)?;
    executor::download_backup(&state, body.drive.as_deref(), &body.backup_name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /backups, newest first.
pub async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupRecord>>, AppError> {
    Ok(Json(state.tracker.list_all().await?))
}

#[cfg(test)]
mod tests {
    use crate::models::backup_record::{BackupKind, BackupStatus};
    use crate::routes::create_router;
    use crate::testing::{t, test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_full_backup_returns_no_content() {
        let env = test_state();
        env.clock.set(t(1, 0));
        let app = create_router(env.state.clone());

        let response = app
            .oneshot(post_json("/full", r#"{"drive": "gdrive:"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let records = env.state.tracker.list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, BackupKind::Full);
        assert_eq!(records[0].comment, "Manual full backup");
    }

    #[tokio::test]
    async fn test_disconnected_client_does_not_abandon_backup() {
        let env = test_state();
        env.tool.delay_ms.store(300, Ordering::SeqCst);
        let app = create_router(env.state.clone());

        // Dropping the response future is what the server does when the client goes away
        let abandoned = tokio::time::timeout(Duration::from_millis(50), app.oneshot(post_json("/full", "{}"))).await;
        assert!(abandoned.is_err());

        let tracked = async {
            loop {
                let records = env.state.tracker.list_all().await.unwrap();
                if !records.is_empty() {
                    return records;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let records = tokio::time::timeout(Duration::from_secs(5), tracked).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].local_path(&env.state.config.backup_dir).exists());
    }

    #[tokio::test]
    async fn test_download_during_shutdown_is_unavailable() {
        let env = test_state();
        env.state.transfers.shutdown(Duration::from_secs(1)).await;
        let app = create_router(env.state.clone());
        let response = app
            .oneshot(post_json("/download", r#"{"backup_name": "db_20240101_000000_000000"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_comment_is_recorded() {
        let env = test_state();
        let app = create_router(env.state.clone());
        app.clone()
            .oneshot(post_json("/full", r#"{"comment": "before upgrade"}"#))
            .await
            .unwrap();
        env.clock.set(t(0, 5));
        let response = app.oneshot(post_json("/incremental", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let records = env.state.tracker.list_all().await.unwrap();
        assert_eq!(records[0].comment, "Manual incremental backup");
        assert_eq!(records[1].comment, "before upgrade");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let env = test_state();
        let app = create_router(env.state.clone());

        let response = app.oneshot(post_json("/full", "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
        assert!(env.tool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_download_without_name_is_bad_request() {
        let env = test_state();
        let app = create_router(env.state.clone());
        let response = app.oneshot(post_json("/download", r#"{"drive": "x:"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_download_rejects_traversal() {
        let env = test_state();
        let app = create_router(env.state.clone());
        let response = app
            .oneshot(post_json("/download", r#"{"backup_name": "../../etc"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(env.storage.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_download_is_queued() {
        let env = test_state();
        let app = create_router(env.state.clone());
        let response = app
            .oneshot(post_json("/download", r#"{"backup_name": "db_20240101_000000_000000"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        env.state.transfers.shutdown(Duration::from_secs(5)).await;
        assert_eq!(env.storage.downloads().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_without_full_is_server_error() {
        let env = test_state();
        let app = create_router(env.state.clone());

        let response = app.oneshot(post_json("/incremental", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("no full backup"));
    }

    #[tokio::test]
    async fn test_list_backups_newest_first() {
        let env = test_state();
        let tracker = &env.state.tracker;
        tracker.append(t(1, 0), BackupKind::Full, String::new()).await.unwrap();
        tracker.append(t(2, 0), BackupKind::Incremental, String::new()).await.unwrap();
        tracker.set_status(t(1, 0), BackupStatus::Uploaded).await.unwrap();

        let app = create_router(env.state.clone());
        let request = Request::builder().uri("/backups").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["kind"], "incremental");
        assert_eq!(records[1]["status"], "uploaded");
    }
}
