use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::json;

use super::checked_project;
use crate::api::rest::error::ApiResult;
use crate::api::AppState;
use crate::shared::models::ProcessRecord;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessListResponse {
    pub project_id: String,
    pub processes: Vec<ProcessRecord>,
}

pub async fn list_processes(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProcessListResponse>> {
    let project_id = checked_project(project_id)?;
    let processes = state.services.processes.list(&project_id).await?;
    Ok(Json(ProcessListResponse {
        project_id,
        processes,
    }))
}

pub async fn kill_process(
    State(state): State<Arc<AppState>>,
    Path((project_id, pid)): Path<(String, u32)>,
) -> ApiResult<Json<serde_json::Value>> {
    let project_id = checked_project(project_id)?;
    state.services.processes.kill(&project_id, pid).await?;
    Ok(Json(json!({
        "projectId": project_id,
        "pid": pid,
        "signal": "SIGTERM",
    })))
}
