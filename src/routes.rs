//! HTTP surface for artifact retrieval

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::backup::BackupError;
use crate::backup::storage::presign::ObjectStorageAdapter;
use crate::backup::storage::{ArtifactLocation, resolve_artifact};
use crate::db::{self, DbPool};

// Application state shared by all handlers
pub struct AppState {
    pub db_pool: DbPool,
    pub presigner: ObjectStorageAdapter,
    pub presigned_url_expiry_minutes: u32,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/snapshots/{id}/download", get(download_handler))
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// Redirect to a presigned URL for S3 volumes, stream the file for local ones
async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, (StatusCode, String)> {
    let snapshot = db::get_snapshot(&state.db_pool, id).await.map_err(error_response)?;
    let location = resolve_artifact(&snapshot, &state.presigner, state.presigned_url_expiry_minutes)
        .await
        .map_err(error_response)?;

    match location {
        ArtifactLocation::Redirect(url) => {
            info!(snapshot_id = id, volume = "s3", "Redirecting snapshot download");
            Ok(Redirect::temporary(&url).into_response())
        }
        ArtifactLocation::LocalFile(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| error_response(BackupError::Io(e)))?;
            let download_name = snapshot
                .filename
                .rsplit('/')
                .next()
                .unwrap_or(snapshot.filename.as_str())
                .replace('"', "");

            info!(snapshot_id = id, volume = "local", "Streaming snapshot download");
            Ok((
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", download_name)),
                ],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response())
        }
    }
}

/// HTTP status for an error surfaced by artifact retrieval
pub fn status_for(error: &BackupError) -> StatusCode {
    match error {
        BackupError::UnsupportedStorageType(_)
        | BackupError::Validation(_)
        | BackupError::UnsafePath(_)
        | BackupError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BackupError::SnapshotNotFound | BackupError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: BackupError) -> (StatusCode, String) {
    let status = status_for(&error);
    if status.is_server_error() {
        error!(error = %error, "Snapshot download failed");
        (status, "snapshot download failed".into())
    } else {
        (status, error.to_string())
    }
}
