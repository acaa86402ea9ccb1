//! Client-facing status refresh.
//!
//! One call asks the provider for ground truth on a pending payment and, when
//! the answer is terminal or the verification window has run out, finalizes
//! it. Transient provider failures are reported as `provider_error` and leave
//! the record untouched.

use crate::config::PaymentsConfig;
use crate::database::error::DatabaseError;
use crate::database::repository::PaymentStore;
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use crate::payments::normalize::ProviderStatus;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{Payment, PaymentStatus};
use crate::services::finalization::{
    FailureReason, FinalizationEngine, FinalizationSource, FinalizeError, Outcome,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reported instead of a provider status when the lookup itself failed.
pub const PROVIDER_ERROR: &str = "provider_error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<u64>,
}

impl RefreshOutcome {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_provider_error(&self) -> bool {
        self.provider_status.as_deref() == Some(PROVIDER_ERROR)
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("payment {0} not found")]
    NotFound(Uuid),

    #[error("payment {0} belongs to another user")]
    Forbidden(Uuid),

    #[error("payment {0} has no provider transaction id")]
    MissingProviderReference(Uuid),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<RefreshError> for AppError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NotFound(id) => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
                    payment_id: id.to_string(),
                }))
            }
            RefreshError::Forbidden(id) => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentForbidden {
                    payment_id: id.to_string(),
                }))
            }
            RefreshError::MissingProviderReference(_) => AppError::new(
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: err.to_string(),
                }),
            ),
            RefreshError::Finalize(e) => e.into(),
            RefreshError::Database(e) => e.into(),
        }
    }
}

pub struct StatusRefreshService {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn PaymentProvider>,
    engine: Arc<FinalizationEngine>,
    config: PaymentsConfig,
}

impl StatusRefreshService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        provider: Arc<dyn PaymentProvider>,
        engine: Arc<FinalizationEngine>,
        config: PaymentsConfig,
    ) -> Self {
        Self {
            store,
            provider,
            engine,
            config,
        }
    }

    /// Payment as seen by its owner.
    pub async fn get_owned(&self, payment_id: Uuid, user_id: Uuid) -> Result<Payment, RefreshError> {
        let payment = self
            .store
            .find_by_id(payment_id)
            .await?
            .ok_or(RefreshError::NotFound(payment_id))?;

        if payment.user_id != user_id {
            warn!(payment_id = %payment_id, "payment requested by non-owner");
            return Err(RefreshError::Forbidden(payment_id));
        }
        Ok(payment)
    }

    pub async fn refresh(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
    ) -> Result<RefreshOutcome, RefreshError> {
        let payment = self.get_owned(payment_id, user_id).await?;

        if payment.is_terminal() {
            return Ok(RefreshOutcome {
                status: payment.status,
                provider_status: None,
                expires_in_ms: None,
            });
        }

        let remaining = payment.time_remaining(self.config.verification_window, Utc::now());
        let expires_in_ms = Some(remaining.as_millis() as u64);

        let reference = payment
            .provider_reference()
            .ok_or(RefreshError::MissingProviderReference(payment_id))?;
        if payment.provider_transaction_id.is_none() {
            // Promote the metadata reference so webhooks can find the row.
            if let Err(e) = self
                .store
                .attach_provider_reference(payment_id, &reference)
                .await
            {
                warn!(payment_id = %payment_id, error = %e, "failed to persist provider reference");
            }
        }

        let lookup = match self.provider.lookup_transaction(&reference).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(
                    payment_id = %payment_id,
                    provider = self.provider.name(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "provider lookup failed, payment stays pending"
                );
                return Ok(RefreshOutcome {
                    status: PaymentStatus::Pending,
                    provider_status: Some(PROVIDER_ERROR.to_string()),
                    expires_in_ms,
                });
            }
        };

        debug!(
            payment_id = %payment_id,
            provider_status = %lookup.status,
            matched = lookup.matched,
            "provider status fetched"
        );

        let outcome = match lookup.status {
            ProviderStatus::Success => Some(Outcome::Success),
            ProviderStatus::Failed => Some(Outcome::Failure {
                reason: FailureReason::ProviderFailed,
            }),
            ProviderStatus::Pending | ProviderStatus::Unknown if remaining.is_zero() => {
                info!(payment_id = %payment_id, "verification window elapsed");
                Some(Outcome::Failure {
                    reason: FailureReason::VerificationTimeout,
                })
            }
            ProviderStatus::Pending | ProviderStatus::Unknown => None,
        };

        let status = match outcome {
            Some(outcome) => self
                .engine
                .finalize_observed(
                    payment_id,
                    outcome,
                    FinalizationSource::StatusRefresh,
                    lookup.status,
                )
                .await?
                .status(),
            None => PaymentStatus::Pending,
        };

        Ok(RefreshOutcome {
            status,
            provider_status: Some(lookup.status.as_str().to_string()),
            expires_in_ms,
        })
    }
}
