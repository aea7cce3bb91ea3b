use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use crate::error::{RecognitionError, RecognitionResult};
use crate::pipeline::Recognizer;
use crate::AppState;

fn error_response(e: RecognitionError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        RecognitionError::InputValidation { field, message } => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"error": e.to_string(), "field": field, "message": message})),
            );
        }
        RecognitionError::StaleStage { .. } | RecognitionError::AlbumBusy(_) => StatusCode::CONFLICT,
        RecognitionError::TtlExpired(_) => StatusCode::GONE,
        RecognitionError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            error!("request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": e.to_string()})))
}

fn respond<T: Serialize>(result: RecognitionResult<T>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(v) => (StatusCode::OK, Json(serde_json::to_value(v).unwrap_or(Value::Null))),
        Err(e) => error_response(e),
    }
}

/// Stage handlers block on SQLite and the staging store.
async fn blocking<T, F>(state: &AppState, f: F) -> RecognitionResult<T>
where
    T: Send + 'static,
    F: FnOnce(Recognizer) -> RecognitionResult<T> + Send + 'static,
{
    let recognizer = state.recognizer.clone();
    tokio::task::spawn_blocking(move || f(recognizer))
        .await
        .map_err(|e| RecognitionError::Backend(anyhow::anyhow!("request task failed: {}", e)))?
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (queued, running) = state.recognizer.gauges().depths();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": "SQLite",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "queued_jobs": queued,
        "running_jobs": running,
    }))
}

pub async fn recognition_status(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.status(id)).await)
}

pub async fn start_recognition(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.start(id)).await)
}

pub async fn resume_recognition(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.resume(id)).await)
}

pub async fn submit_stage(
    State(state): State<Arc<AppState>>,
    Path((id, stage)): Path<(i64, i64)>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.submit(id, stage, &payload)).await)
}

pub async fn similar_people(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.search(id)).await)
}

pub async fn delete_person(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.delete_person(id)).await.map(|_| serde_json::json!({"success": true})))
}

pub async fn delete_pattern(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.delete_pattern(id)).await.map(|_| serde_json::json!({"success": true})))
}

pub async fn delete_face(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(blocking(&state, move |r| r.delete_face(id)).await.map(|_| serde_json::json!({"success": true})))
}

pub async fn delete_photo(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(
        blocking(&state, move |r| r.delete_photo(id))
            .await
            .map(|removed| serde_json::json!({"success": true, "faces_removed": removed})),
    )
}

#[derive(Deserialize)]
pub struct PrivacyReq {
    pub is_private: bool,
}

pub async fn set_photo_privacy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PrivacyReq>,
) -> impl IntoResponse {
    let private = req.is_private;
    respond(
        blocking(&state, move |r| r.set_photo_private(id, private))
            .await
            .map(|removed| serde_json::json!({"success": true, "faces_removed": removed})),
    )
}
