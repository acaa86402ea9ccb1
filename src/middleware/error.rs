//! JSON rendering of [`AppError`] for API clients.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Body of every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    pub message: String,
    /// Echo of `x-request-id` so support can find the matching log lines.
    pub request_id: Option<String>,
    /// RFC 3339.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            retryable: Some(error.is_retryable()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                error = %self.log_message(),
                context = ?self.context,
                request_id = ?self.request_id,
                status = status.as_u16(),
                "request failed with server error"
            );
        } else {
            tracing::warn!(
                error = %self.log_message(),
                context = ?self.context,
                request_id = ?self.request_id,
                status = status.as_u16(),
                "request rejected"
            );
        }

        (status, Json(ErrorResponse::from_app_error(&self))).into_response()
    }
}

pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppErrorKind, DomainError, InfrastructureError};

    #[test]
    fn error_body_carries_code_and_request_id() {
        let app_error = AppError::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
            payment_id: "p-1".to_string(),
        }))
        .with_request_id("req_123");

        let error_response = ErrorResponse::from_app_error(&app_error);

        assert_eq!(error_response.error, ErrorCode::PaymentNotFound);
        assert_eq!(error_response.request_id, Some("req_123".to_string()));
        assert_eq!(error_response.retryable, Some(false));
    }

    #[test]
    fn responses_use_mapped_status() {
        let app_error = AppError::new(AppErrorKind::Domain(DomainError::PaymentForbidden {
            payment_id: "p-2".to_string(),
        }));
        assert_eq!(app_error.into_response().status(), StatusCode::FORBIDDEN);

        let app_error = AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: "missing provider reference".to_string(),
            },
        ));
        assert_eq!(
            app_error.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_codes_serialize_screaming_case() {
        let json = serde_json::to_value(ErrorCode::PaymentForbidden).unwrap();
        assert_eq!(json, serde_json::json!("PAYMENT_FORBIDDEN"));
    }
}
