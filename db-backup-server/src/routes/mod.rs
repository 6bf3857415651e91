pub mod backups;
pub mod health;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/full", post(backups::trigger_full))
        .route("/incremental", post(backups::trigger_incremental))
        .route("/download", post(backups::trigger_download))
        .route("/backups", get(backups::list_backups))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` until `cancel` fires, then give in-flight requests `grace`
/// to finish before dropping them.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    let server = axum::serve(listener, app).with_graceful_shutdown(cancel.clone().cancelled_owned());
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server => result??,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result??,
                Err(_) => {
                    tracing::warn!("HTTP requests did not finish in time, aborting");
                    server.abort();
                }
            }
        }
    }
    Ok(())
}
