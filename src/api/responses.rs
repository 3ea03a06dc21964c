//! Common API response types

use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;

use crate::models::HubError;

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a success response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// List response with its total
#[derive(Debug, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T: Serialize> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            total: items.len(),
            items,
        }
    }
}

/// HTTP status for each error kind
pub fn status_for(error: &HubError) -> StatusCode {
    match error {
        HubError::NotFound { .. } => StatusCode::NOT_FOUND,
        HubError::UnknownTarget { .. } => StatusCode::NOT_FOUND,
        HubError::Validation(_) => StatusCode::BAD_REQUEST,
        HubError::SerializationError(_) => StatusCode::BAD_REQUEST,
        HubError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        HubError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        HubError::Transport(_) => StatusCode::BAD_GATEWAY,
        HubError::NetworkError(_) => StatusCode::BAD_GATEWAY,
        HubError::ProbeFailed(_) => StatusCode::BAD_GATEWAY,
        HubError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        HubError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert HubError to HTTP response
impl From<HubError> for HttpResponse {
    fn from(error: HubError) -> Self {
        HttpResponse::build(status_for(&error)).json(ApiResponse::<()>::error(error.to_string()))
    }
}

/// Result type that can be converted to HttpResponse
pub type ApiResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&HubError::not_found("service", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&HubError::RateLimitExceeded("x".to_string())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&HubError::NotConnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ApiResponse::<()>::error("boom")).unwrap();
        assert_eq!(body, serde_json::json!({"success": false, "error": "boom"}));

        let list = serde_json::to_value(ListResponse::new(vec![1, 2])).unwrap();
        assert_eq!(list["total"], 2);
    }
}
