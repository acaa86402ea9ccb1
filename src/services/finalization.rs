//! Exactly-once terminal transitions for payments.
//!
//! Every path that learns a payment's final outcome (client refresh, provider
//! webhook, sweeper) funnels through [`FinalizationEngine::finalize`]. The
//! engine never reads-then-writes the status: it hands the store a single
//! guarded settlement and reports whoever won.

use crate::config::PaymentsConfig;
use crate::database::error::DatabaseError;
use crate::database::repository::{EntitlementGrant, PaymentStore, Settlement};
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use crate::logging::mask_phone_number;
use crate::payments::normalize::ProviderStatus;
use crate::payments::types::{Payment, PaymentStatus, ProductType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ProviderFailed,
    VerificationTimeout,
    Abandoned,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ProviderFailed => "provider_failed",
            FailureReason::VerificationTimeout => "verification_timeout",
            FailureReason::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { reason: FailureReason },
}

/// Which path asked for the transition. Recorded as `finalized_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationSource {
    StatusRefresh,
    Webhook,
    Sweeper,
}

impl FinalizationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizationSource::StatusRefresh => "status_refresh",
            FinalizationSource::Webhook => "webhook",
            FinalizationSource::Sweeper => "sweeper",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    /// This call performed the transition.
    Applied(Payment),
    /// The payment was already terminal, possibly settled by a concurrent
    /// caller a moment ago.
    AlreadySettled(PaymentStatus),
}

impl Finalization {
    pub fn status(&self) -> PaymentStatus {
        match self {
            Finalization::Applied(payment) => payment.status,
            Finalization::AlreadySettled(status) => *status,
        }
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("payment {0} not found")]
    NotFound(Uuid),

    #[error("profile unlock payment {0} has no target profile")]
    MissingUnlockTarget(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<FinalizeError> for AppError {
    fn from(err: FinalizeError) -> Self {
        match err {
            FinalizeError::NotFound(id) => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
                    payment_id: id.to_string(),
                }))
            }
            FinalizeError::MissingUnlockTarget(_) => AppError::new(AppErrorKind::Infrastructure(
                InfrastructureError::Configuration {
                    message: err.to_string(),
                },
            )),
            FinalizeError::Database(e) => e.into(),
        }
    }
}

pub struct FinalizationEngine {
    store: Arc<dyn PaymentStore>,
    config: PaymentsConfig,
}

impl FinalizationEngine {
    pub fn new(store: Arc<dyn PaymentStore>, config: PaymentsConfig) -> Self {
        Self { store, config }
    }

    pub async fn finalize(
        &self,
        payment_id: Uuid,
        outcome: Outcome,
        source: FinalizationSource,
    ) -> Result<Finalization, FinalizeError> {
        self.transition(payment_id, outcome, source, None).await
    }

    /// Like [`finalize`](Self::finalize), also recording the provider status
    /// that decided the outcome as `provider_status` in metadata.
    pub async fn finalize_observed(
        &self,
        payment_id: Uuid,
        outcome: Outcome,
        source: FinalizationSource,
        provider_status: ProviderStatus,
    ) -> Result<Finalization, FinalizeError> {
        self.transition(payment_id, outcome, source, Some(provider_status))
            .await
    }

    async fn transition(
        &self,
        payment_id: Uuid,
        outcome: Outcome,
        source: FinalizationSource,
        provider_status: Option<ProviderStatus>,
    ) -> Result<Finalization, FinalizeError> {
        let payment = self
            .store
            .find_by_id(payment_id)
            .await?
            .ok_or(FinalizeError::NotFound(payment_id))?;

        if payment.is_terminal() {
            return Ok(Finalization::AlreadySettled(payment.status));
        }

        let now = Utc::now();
        let mut metadata_patch = json!({ "finalized_by": source.as_str() });
        if let Some(status) = provider_status {
            metadata_patch["provider_status"] = json!(status.as_str());
        }
        let settlement = match outcome {
            Outcome::Success => Settlement {
                status: PaymentStatus::Completed,
                failure_reason: None,
                finalized_at: now,
                metadata_patch,
                grant: Some(self.grant_for(&payment, now)?),
            },
            Outcome::Failure { reason } => Settlement {
                status: PaymentStatus::Failed,
                failure_reason: Some(reason.as_str().to_string()),
                finalized_at: now,
                metadata_patch,
                grant: None,
            },
        };

        match self.store.settle(payment_id, settlement).await {
            Ok(Some(settled)) => {
                let payer = settled
                    .metadata
                    .get("phone")
                    .and_then(|v| v.as_str())
                    .map(mask_phone_number)
                    .unwrap_or_default();
                info!(
                    payment_id = %payment_id,
                    user_id = %settled.user_id,
                    payer = %payer,
                    status = %settled.status,
                    product_type = %settled.product_type,
                    failure_reason = ?settled.failure_reason,
                    source = source.as_str(),
                    "payment finalized"
                );
                Ok(Finalization::Applied(settled))
            }
            Ok(None) => {
                // Lost the race; report the winner's status.
                let current = self
                    .store
                    .find_by_id(payment_id)
                    .await?
                    .ok_or(FinalizeError::NotFound(payment_id))?;
                info!(
                    payment_id = %payment_id,
                    status = %current.status,
                    source = source.as_str(),
                    "payment already settled by another path"
                );
                Ok(Finalization::AlreadySettled(current.status))
            }
            Err(e) => {
                error!(payment_id = %payment_id, error = %e, source = source.as_str(), "settlement failed");
                Err(e.into())
            }
        }
    }

    fn grant_for(
        &self,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> Result<EntitlementGrant, FinalizeError> {
        let grant = match payment.product_type {
            ProductType::Subscription => EntitlementGrant::Subscription {
                user_id: payment.user_id,
                days: self.config.subscription_period_days,
            },
            ProductType::ProfileUnlock => EntitlementGrant::ProfileUnlock {
                user_id: payment.user_id,
                target_profile_id: payment
                    .target_resource_id
                    .ok_or(FinalizeError::MissingUnlockTarget(payment.id))?,
            },
            ProductType::DailyUnlock => EntitlementGrant::DailyUnlock {
                user_id: payment.user_id,
                credits: self.config.daily_unlock_credits,
                valid_until: now
                    + chrono::Duration::from_std(self.config.daily_unlock_validity)
                        .unwrap_or_else(|_| chrono::Duration::hours(24)),
            },
        };
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_store::MemoryPaymentStore;
    use crate::payments::types::NewPayment;
    use bigdecimal::BigDecimal;

    fn engine(store: Arc<MemoryPaymentStore>) -> FinalizationEngine {
        FinalizationEngine::new(store, PaymentsConfig::default())
    }

    async fn pending(
        store: &MemoryPaymentStore,
        product_type: ProductType,
        target: Option<Uuid>,
    ) -> Payment {
        store
            .create_pending(NewPayment {
                user_id: Uuid::new_v4(),
                amount: BigDecimal::from(100),
                currency: "KES".to_string(),
                product_type,
                target_resource_id: target,
                provider_transaction_id: Some(Uuid::new_v4().to_string()),
                metadata: json!({}),
            })
            .await
            .unwrap()
    }

    // --- terminal states ---

    #[tokio::test]
    async fn second_finalize_is_a_no_op() {
        let store = Arc::new(MemoryPaymentStore::new());
        let engine = engine(store.clone());
        let payment = pending(&store, ProductType::Subscription, None).await;

        let first = engine
            .finalize(payment.id, Outcome::Success, FinalizationSource::StatusRefresh)
            .await
            .unwrap();
        let second = engine
            .finalize(
                payment.id,
                Outcome::Failure {
                    reason: FailureReason::VerificationTimeout,
                },
                FinalizationSource::Sweeper,
            )
            .await
            .unwrap();

        assert!(matches!(first, Finalization::Applied(_)));
        assert_eq!(
            second,
            Finalization::AlreadySettled(PaymentStatus::Completed)
        );
        assert_eq!(store.grants().len(), 1);
    }

    #[tokio::test]
    async fn failure_records_reason_and_source_without_grant() {
        let store = Arc::new(MemoryPaymentStore::new());
        let engine = engine(store.clone());
        let payment = pending(&store, ProductType::DailyUnlock, None).await;

        let result = engine
            .finalize(
                payment.id,
                Outcome::Failure {
                    reason: FailureReason::ProviderFailed,
                },
                FinalizationSource::Webhook,
            )
            .await
            .unwrap();

        let Finalization::Applied(settled) = result else {
            panic!("expected the transition to be applied");
        };
        assert_eq!(settled.status, PaymentStatus::Failed);
        assert_eq!(settled.failure_reason.as_deref(), Some("provider_failed"));
        assert_eq!(settled.metadata["finalized_by"], "webhook");
        assert!(settled.finalized_at.is_some());
        assert!(store.grants().is_empty());
    }

    // --- grants ---

    #[tokio::test]
    async fn profile_unlock_grants_target() {
        let store = Arc::new(MemoryPaymentStore::new());
        let engine = engine(store.clone());
        let target = Uuid::new_v4();
        let payment = pending(&store, ProductType::ProfileUnlock, Some(target)).await;

        engine
            .finalize(payment.id, Outcome::Success, FinalizationSource::StatusRefresh)
            .await
            .unwrap();

        assert!(store.has_profile_unlock(payment.user_id, target));
    }

    #[tokio::test]
    async fn daily_unlock_grants_configured_credits() {
        let store = Arc::new(MemoryPaymentStore::new());
        let engine = engine(store.clone());
        let payment = pending(&store, ProductType::DailyUnlock, None).await;

        engine
            .finalize(payment.id, Outcome::Success, FinalizationSource::StatusRefresh)
            .await
            .unwrap();

        assert_eq!(store.unlock_credits(payment.user_id, Utc::now()), 10);
        assert_eq!(
            store.unlock_credits(payment.user_id, Utc::now() + chrono::Duration::hours(25)),
            0
        );
    }

    #[tokio::test]
    async fn observed_provider_status_is_merged_into_metadata() {
        let store = Arc::new(MemoryPaymentStore::new());
        let engine = engine(store.clone());
        let payment = pending(&store, ProductType::Subscription, None).await;

        engine
            .finalize_observed(
                payment.id,
                Outcome::Failure {
                    reason: FailureReason::ProviderFailed,
                },
                FinalizationSource::Webhook,
                ProviderStatus::Failed,
            )
            .await
            .unwrap();

        let stored = store.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata["provider_status"], "failed");
        assert_eq!(stored.metadata["finalized_by"], "webhook");
    }

    #[tokio::test]
    async fn unlock_without_target_stays_pending() {
        let store = Arc::new(MemoryPaymentStore::new());
        let engine = engine(store.clone());
        let mut payment = pending(&store, ProductType::DailyUnlock, None).await;
        payment.product_type = ProductType::ProfileUnlock;
        store.insert(payment.clone()).unwrap();

        let err = engine
            .finalize(payment.id, Outcome::Success, FinalizationSource::StatusRefresh)
            .await
            .unwrap_err();

        assert!(matches!(err, FinalizeError::MissingUnlockTarget(_)));
        let stored = store.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(AppError::from(err).status_code(), 500);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let store = Arc::new(MemoryPaymentStore::new());
        let err = engine(store)
            .finalize(Uuid::new_v4(), Outcome::Success, FinalizationSource::Sweeper)
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizeError::NotFound(_)));
    }
}
