use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::{Payment, PaymentStatus, ProductType};
use crate::services::status_refresh::{RefreshOutcome, StatusRefreshService};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Header carrying the authenticated account id, set by the session layer
/// in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct PaymentsState {
    pub refresh: Arc<StatusRefreshService>,
    pub verification_window: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub id: Uuid,
    pub status: PaymentStatus,
    pub product_type: ProductType,
    pub amount: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resource_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<u64>,
}

impl PaymentView {
    fn from_payment(payment: Payment, window: Duration) -> Self {
        let expires_in_ms = (!payment.is_terminal())
            .then(|| payment.time_remaining(window, Utc::now()).as_millis() as u64);
        Self {
            id: payment.id,
            status: payment.status,
            product_type: payment.product_type,
            amount: payment.amount.to_string(),
            currency: payment.currency,
            target_resource_id: payment.target_resource_id,
            failure_reason: payment.failure_reason,
            created_at: payment.created_at,
            finalized_at: payment.finalized_at,
            expires_in_ms,
        }
    }
}

pub fn routes(state: PaymentsState) -> Router {
    Router::new()
        .route("/api/payments/{payment_id}", get(get_payment))
        .route("/api/payments/{payment_id}/refresh", post(refresh_payment))
        .with_state(state)
}

/// POST /api/payments/{payment_id}/refresh
pub async fn refresh_payment(
    State(state): State<PaymentsState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RefreshOutcome>, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let with_request_id = |e: AppError| match request_id.as_deref() {
        Some(id) => e.with_request_id(id),
        None => e,
    };

    let payment_id = parse_payment_id(&payment_id).map_err(with_request_id)?;
    let user_id = caller_id(&headers).map_err(with_request_id)?;

    let outcome = state
        .refresh
        .refresh(payment_id, user_id)
        .await
        .map_err(|e| with_request_id(AppError::from(e).with_context("status refresh")))?;

    info!(
        payment_id = %payment_id,
        status = %outcome.status,
        provider_status = ?outcome.provider_status,
        expires_in_ms = ?outcome.expires_in_ms,
        "payment status refreshed"
    );
    Ok(Json(outcome))
}

/// GET /api/payments/{payment_id}
pub async fn get_payment(
    State(state): State<PaymentsState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PaymentView>, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let with_request_id = |e: AppError| match request_id.as_deref() {
        Some(id) => e.with_request_id(id),
        None => e,
    };

    let payment_id = parse_payment_id(&payment_id).map_err(with_request_id)?;
    let user_id = caller_id(&headers).map_err(with_request_id)?;

    let payment = state
        .refresh
        .get_owned(payment_id, user_id)
        .await
        .map_err(|e| with_request_id(e.into()))?;

    Ok(Json(PaymentView::from_payment(
        payment,
        state.verification_window,
    )))
}

fn parse_payment_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: "payment_id".to_string(),
            reason: "must be a UUID".to_string(),
        }))
    })
}

fn caller_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| AppError::new(AppErrorKind::Domain(DomainError::Unauthenticated)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn caller_id_requires_uuid_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_id(&headers).unwrap_err().status_code(), 401);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(caller_id(&headers).unwrap_err().status_code(), 401);

        let user_id = Uuid::new_v4();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&user_id.to_string()).unwrap(),
        );
        assert_eq!(caller_id(&headers).unwrap(), user_id);
    }

    #[test]
    fn payment_id_must_be_uuid() {
        assert_eq!(parse_payment_id("abc").unwrap_err().status_code(), 400);
        assert!(parse_payment_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
