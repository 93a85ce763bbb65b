use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::jobs::store::JobStore;

pub mod models;

use models::{ErrorBody, JobView};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs/:id", get(get_job))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn get_job(Path(id): Path<Uuid>, State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.get(id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(JobView::from(job))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "job not found".into(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("internal error: {e}"),
            }),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
