use axum::http::Method;
use axum::{routing::{delete, get, post}, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::api::handlers;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(vec![axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/albums/:id/recognition", get(handlers::recognition_status))
        .route("/albums/:id/recognition/start", post(handlers::start_recognition))
        .route("/albums/:id/recognition/resume", post(handlers::resume_recognition))
        .route("/albums/:id/recognition/stages/:stage", post(handlers::submit_stage))
        .route("/persons/:id/similar", post(handlers::similar_people))
        .route("/persons/:id", delete(handlers::delete_person))
        .route("/patterns/:id", delete(handlers::delete_pattern))
        .route("/faces/:id", delete(handlers::delete_face))
        .route("/photos/:id", delete(handlers::delete_photo))
        .route("/photos/:id/privacy", post(handlers::set_photo_privacy))
        .layer(cors)
        .with_state(state)
}
