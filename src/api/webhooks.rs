use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::services::webhook_processor::{
    WebhookOutcome, WebhookProcessor, WebhookProcessorError,
};

/// Hex HMAC-SHA256 of the raw body, keyed with the webhook secret.
pub const SIGNATURE_HEADER: &str = "x-signature";

pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

pub fn routes(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/mpesa", post(handle_mpesa_webhook))
        .with_state(state)
}

/// POST /webhooks/mpesa
pub async fn handle_mpesa_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    info!(bytes = body.len(), "Received M-Pesa webhook");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());

    if signature.is_none() {
        warn!("Missing webhook signature");
        return (StatusCode::UNAUTHORIZED, "Missing signature").into_response();
    }

    match state
        .processor
        .process_webhook(signature.as_deref(), &body)
        .await
    {
        Ok(WebhookOutcome::Finalized { payment_id, status }) => {
            info!(payment_id = %payment_id, status = %status, "Webhook finalized payment");
            ok()
        }
        Ok(WebhookOutcome::AlreadySettled { payment_id, status }) => {
            info!(payment_id = %payment_id, status = %status, "Webhook for settled payment");
            ok()
        }
        Ok(WebhookOutcome::Ignored { reason }) => {
            info!(reason = %reason, "Webhook ignored");
            ok()
        }
        Err(WebhookProcessorError::InvalidSignature) => {
            warn!("Invalid webhook signature");
            (StatusCode::UNAUTHORIZED, "Invalid signature").into_response()
        }
        Err(e) => {
            // Acknowledge anyway; the sweeper reconciles whatever was missed.
            error!(error = %e, "Webhook processing failed");
            ok()
        }
    }
}

fn ok() -> axum::response::Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}
