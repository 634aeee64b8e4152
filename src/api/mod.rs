use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::install::{BuildStats, ErrorCategory, InstallController, InstallStage, InstallerState};

pub fn routes() -> Router<InstallController> {
    Router::new()
        .route("/status", get(get_status))
        .route("/control", post(control_install))
        .route("/logs", get(get_logs))
}

#[derive(Serialize)]
struct StatusResponse {
    id: String,
    #[serde(rename = "appName")]
    app_name: String,
    version: String,
    state: Option<InstallerState>,
    stage: Option<InstallStage>,
    #[serde(rename = "stageDescription")]
    stage_description: Option<&'static str>,
    progress: f32,
    paused: bool,
    running: bool,
    complete: bool,
    #[serde(rename = "hasError")]
    has_error: bool,
    cancelled: bool,
    error: Option<String>,
    #[serde(rename = "errorCategory")]
    error_category: Option<ErrorCategory>,
    #[serde(rename = "downloadSpeed")]
    download_speed: Option<f64>,
    #[serde(rename = "downloadBytesLeft")]
    download_bytes_left: u64,
    #[serde(rename = "initialDownloadSize")]
    initial_download_size: u64,
    stats: BuildStats,
}

async fn get_status(State(controller): State<InstallController>) -> Json<StatusResponse> {
    let snapshot = controller.snapshot();
    Json(StatusResponse {
        id: snapshot.id.to_string(),
        app_name: snapshot.app_name,
        version: snapshot.version,
        state: snapshot.state,
        stage: snapshot.stage,
        stage_description: snapshot.stage.map(InstallStage::description),
        progress: snapshot.progress,
        paused: snapshot.paused,
        running: snapshot.running,
        complete: snapshot.complete,
        has_error: snapshot.has_error,
        cancelled: snapshot.cancelled,
        error: (!snapshot.error.is_empty()).then_some(snapshot.error),
        error_category: snapshot.error_category,
        download_speed: (snapshot.download_speed >= 0.0).then_some(snapshot.download_speed),
        download_bytes_left: snapshot.download_bytes_left,
        initial_download_size: snapshot.initial_download_size,
        stats: snapshot.stats,
    })
}

#[derive(Deserialize)]
struct ControlRequest {
    action: String,
}

async fn control_install(
    State(controller): State<InstallController>,
    Json(req): Json<ControlRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match req.action.as_str() {
        "pause" | "resume" => {
            let want_paused = req.action == "pause";
            let paused = if controller.is_paused() == want_paused {
                want_paused
            } else {
                controller.toggle_pause()
            };
            let status = if paused == want_paused { StatusCode::OK } else { StatusCode::CONFLICT };
            (status, Json(serde_json::json!({ "paused": paused })))
        }
        "cancel" => {
            controller.cancel();
            (StatusCode::OK, Json(serde_json::json!({ "cancelled": true })))
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("Unknown action: {}", other) })),
        ),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn get_logs(
    State(controller): State<InstallController>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let logs = controller.logs(Some(query.limit.unwrap_or(100)));
    let formatted_logs: Vec<_> = logs
        .into_iter()
        .map(|log| {
            serde_json::json!({
                "timestamp": chrono::DateTime::from_timestamp(log.timestamp, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| log.timestamp.to_string()),
                "level": log.level,
                "message": log.message,
                "attempt": log.attempt,
            })
        })
        .collect();

    Json(serde_json::json!({ "logs": formatted_logs }))
}
