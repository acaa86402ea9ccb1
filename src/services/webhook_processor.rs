use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::repository::PaymentStore;
use crate::payments::normalize::ProviderStatus;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::PaymentStatus;
use crate::services::finalization::{
    FailureReason, Finalization, FinalizationEngine, FinalizationSource, Outcome,
};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Processing error: {0}")]
    ProcessingError(String),
}

/// What a delivered event did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Finalized {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    AlreadySettled {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    Ignored {
        reason: String,
    },
}

pub struct WebhookProcessor {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn PaymentProvider>,
    engine: Arc<FinalizationEngine>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        provider: Arc<dyn PaymentProvider>,
        engine: Arc<FinalizationEngine>,
    ) -> Self {
        Self {
            store,
            provider,
            engine,
        }
    }

    /// Verifies and applies one provider callback. `payload` must be the raw
    /// request body the signature was computed over.
    pub async fn process_webhook(
        &self,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let provider_name = self.provider.name();
        let signature = signature.ok_or(WebhookProcessorError::InvalidSignature)?;

        let verification = self
            .provider
            .verify_webhook(payload, signature)
            .map_err(|e| WebhookProcessorError::ProcessingError(e.to_string()))?;
        if !verification.valid {
            error!(
                provider = %provider_name,
                reason = ?verification.reason,
                "Invalid webhook signature"
            );
            return Err(WebhookProcessorError::InvalidSignature);
        }

        let event = self
            .provider
            .parse_webhook_event(payload)
            .map_err(|e| WebhookProcessorError::MalformedPayload(e.to_string()))?;

        let transaction_id = match event.transaction_id.as_deref() {
            Some(id) => id,
            None => {
                warn!(provider = %provider_name, "Webhook without transaction reference");
                return Ok(WebhookOutcome::Ignored {
                    reason: "missing transaction reference".to_string(),
                });
            }
        };

        let outcome = match event.status {
            ProviderStatus::Success => Outcome::Success,
            ProviderStatus::Failed => Outcome::Failure {
                reason: FailureReason::ProviderFailed,
            },
            ProviderStatus::Pending | ProviderStatus::Unknown => {
                info!(
                    transaction_id = %transaction_id,
                    status = %event.status,
                    "Non-terminal webhook status, nothing to do"
                );
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("non-terminal status {}", event.status),
                });
            }
        };

        let payment = self
            .store
            .find_by_provider_reference(transaction_id)
            .await
            .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?;
        let payment = match payment {
            Some(payment) => payment,
            None => {
                warn!(transaction_id = %transaction_id, "Webhook for unknown transaction");
                return Ok(WebhookOutcome::Ignored {
                    reason: "unknown transaction".to_string(),
                });
            }
        };

        let finalization = self
            .engine
            .finalize_observed(
                payment.id,
                outcome,
                FinalizationSource::Webhook,
                event.status,
            )
            .await
            .map_err(|e| WebhookProcessorError::ProcessingError(e.to_string()))?;

        let result = match finalization {
            Finalization::Applied(settled) => WebhookOutcome::Finalized {
                payment_id: settled.id,
                status: settled.status,
            },
            Finalization::AlreadySettled(status) => WebhookOutcome::AlreadySettled {
                payment_id: payment.id,
                status,
            },
        };
        info!(
            provider = %provider_name,
            transaction_id = %transaction_id,
            outcome = ?result,
            "Webhook processed"
        );
        Ok(result)
    }
}
