use axum::{Json, extract::multipart::MultipartError, http::StatusCode, response::IntoResponse};
use delve_core::{DelveError, DocumentError};
use serde::Serialize;
use std::fmt;
use tracing::error;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(error: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        let payload = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl From<DelveError> for AppError {
    fn from(error: DelveError) -> Self {
        let status = match &error {
            DelveError::InvalidRequest(_) | DelveError::Document(DocumentError::UnsupportedFormat(_)) => {
                StatusCode::BAD_REQUEST
            }
            DelveError::SessionNotFound(_) | DelveError::DocumentNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DelveError::InvalidParentState { .. } | DelveError::Transition(_) => {
                StatusCode::CONFLICT
            }
            DelveError::SchedulerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(error: MultipartError) -> Self {
        Self::new(error.status(), error.body_text())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::SessionStatus;
    use uuid::Uuid;

    #[test]
    fn lifecycle_errors_map_to_client_statuses() {
        let parent = DelveError::InvalidParentState {
            parent_id: Uuid::new_v4(),
            status: SessionStatus::Running,
        };
        assert_eq!(AppError::from(parent).status(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::from(DelveError::SessionNotFound(Uuid::new_v4())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(DelveError::Document(DocumentError::UnsupportedFormat(
                "docx".into()
            )))
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(DelveError::SchedulerUnavailable("full".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
