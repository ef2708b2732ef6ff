pub mod containers;
pub mod ports;
pub mod processes;

use crate::api::rest::error::{ApiError, ApiResult};
use crate::shared::models::validate_project_id;

/// Reject malformed project ids before they reach the orchestration layer.
pub(crate) fn checked_project(project_id: String) -> ApiResult<String> {
    validate_project_id(&project_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(project_id)
}
