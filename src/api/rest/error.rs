use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::shared::models::SandboxError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Sandbox(SandboxError),
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    code: &'static str,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Sandbox(e) => {
                let status = match &e {
                    SandboxError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
                    SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
                    SandboxError::ConnectionProtocol(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.code(), e.to_string())
            }
        };
        (status, Json(ErrorResponse { message, code })).into_response()
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        ApiError::Sandbox(e)
    }
}
