use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use super::checked_project;
use crate::api::rest::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::shared::models::ActivePort;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsResponse {
    pub project_id: String,
    pub ports: Vec<ActivePort>,
}

pub async fn list_ports(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<PortsResponse>> {
    let project_id = checked_project(project_id)?;
    let ports = state.services.port_monitor.active_ports(&project_id).await;
    Ok(Json(PortsResponse { project_id, ports }))
}

/// Run a scan now instead of waiting for the next tick.
pub async fn refresh_ports(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<PortsResponse>> {
    let project_id = checked_project(project_id)?;
    let container_id = state
        .services
        .registry
        .container_id(&project_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No container for project {}", project_id)))?;
    let ports = state
        .services
        .port_monitor
        .scan(&project_id, &container_id)
        .await?;
    Ok(Json(PortsResponse { project_id, ports }))
}
