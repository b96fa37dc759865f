//! Route-layer contract: status codes and the JSON response wrapper that a
//! transport (HTTP handler, CLI) wraps manager results in.

use serde::Serialize;

use crate::error::JobError;

/// Transport-neutral outcome class, with its HTTP equivalent.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Ok,
    Created,
    BadRequest,
    Forbidden,
    NotFound,
    Internal,
}

impl ApiStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            ApiStatus::Ok => 200,
            ApiStatus::Created => 201,
            ApiStatus::BadRequest => 400,
            ApiStatus::Forbidden => 403,
            ApiStatus::NotFound => 404,
            ApiStatus::Internal => 500,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApiStatus::Ok | ApiStatus::Created)
    }
}

impl From<&JobError> for ApiStatus {
    fn from(err: &JobError) -> Self {
        match err {
            JobError::Validation(_) | JobError::InvalidState(_) => ApiStatus::BadRequest,
            JobError::NotFound { .. } => ApiStatus::NotFound,
            JobError::PermissionDenied(_) => ApiStatus::Forbidden,
            JobError::Store(_) => ApiStatus::Internal,
        }
    }
}

/// Response wrapper for API calls.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::with_status(ApiStatus::Ok, data)
    }

    pub fn created(data: T) -> Self {
        Self::with_status(ApiStatus::Created, data)
    }

    fn with_status(status: ApiStatus, data: T) -> Self {
        Self {
            success: true,
            status: status.http_code(),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(status: ApiStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: status.http_code(),
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn from_error(err: &JobError) -> Self {
        let status = ApiStatus::from(err);
        // Store internals are not shown to callers.
        let message = match err {
            JobError::Store(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        Self::err(status, message)
    }

    pub fn from_result(result: Result<T, JobError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::from_error(&e),
        }
    }
}

/// Body of a successful cancel or retry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActionAccepted {
    pub job_id: String,
    pub action: &'static str,
}

/// Maps a cancel/retry answer: `false` becomes a 400 carrying `reason`.
pub fn action_response(
    job_id: &str,
    action: &'static str,
    result: Result<bool, JobError>,
    reason: &str,
) -> ApiResponse<ActionAccepted> {
    match result {
        Ok(true) => ApiResponse::ok(ActionAccepted {
            job_id: job_id.to_string(),
            action,
        }),
        Ok(false) => ApiResponse::err(ApiStatus::BadRequest, reason),
        Err(e) => ApiResponse::from_error(&e),
    }
}
