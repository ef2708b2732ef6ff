use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::json;

use super::checked_project;
use crate::api::rest::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::shared::models::{ContainerStats, ContainerSummary, SshInfo};

#[derive(Debug, Serialize)]
pub struct ContainerListResponse {
    pub containers: Vec<ContainerSummary>,
    pub total: usize,
}

pub async fn list_containers(State(state): State<Arc<AppState>>) -> Json<ContainerListResponse> {
    let containers = state.services.registry.summaries().await;
    Json(ContainerListResponse {
        total: containers.len(),
        containers,
    })
}

pub async fn start_container(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ContainerSummary>> {
    let project_id = checked_project(project_id)?;
    state.services.provisioner.create_or_reuse(&project_id).await?;
    state
        .services
        .provisioner
        .status(&project_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No container for project {}", project_id)))
}

pub async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let project_id = checked_project(project_id)?;
    let stopped = state.services.provisioner.stop(&project_id).await?;
    Ok(Json(json!({
        "projectId": project_id,
        "stopped": stopped,
    })))
}

pub async fn container_status(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ContainerSummary>> {
    let project_id = checked_project(project_id)?;
    state
        .services
        .provisioner
        .status(&project_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No container for project {}", project_id)))
}

pub async fn container_stats(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ContainerStats>> {
    let project_id = checked_project(project_id)?;
    Ok(Json(state.services.provisioner.stats(&project_id).await?))
}

pub async fn container_ssh(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<SshInfo>> {
    let project_id = checked_project(project_id)?;
    Ok(Json(state.services.provisioner.ssh_info(&project_id).await?))
}
