use axum::{Json, http::StatusCode};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub timestamp: i64,
    pub db_status: Option<String>,
    pub blob_status: Option<String>,
}

#[axum::debug_handler]
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (StatusCode, Json<HealthCheckResponse>) {
    let db_status = if state.db.ping().await {
        Some("connected".to_string())
    } else {
        None
    };
    let blob_status = if state.blobs.ping().await {
        Some("writable".to_string())
    } else {
        None
    };

    let status = if let (Some(_), Some(_)) = (&db_status, &blob_status) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthCheckResponse {
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            db_status,
            blob_status,
        }),
    )
}
