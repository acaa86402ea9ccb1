use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::repository::{merge_metadata, EntitlementGrant, PaymentStore, Settlement};
use crate::payments::types::{NewPayment, Payment, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    payments: HashMap<Uuid, Payment>,
    /// payment_id -> grant, mirrors `entitlement_grants`.
    grants: HashMap<Uuid, EntitlementGrant>,
    subscriptions: HashMap<Uuid, DateTime<Utc>>,
    profile_unlocks: HashMap<(Uuid, Uuid), Uuid>,
    unlock_credits: HashMap<Uuid, (Uuid, i32, DateTime<Utc>)>,
}

/// Process-local store used by tests and `SKIP_EXTERNALS` runs.
///
/// Every operation runs under one mutex, so a settlement and its grant are
/// observed together or not at all.
#[derive(Default)]
pub struct MemoryPaymentStore {
    state: Mutex<State>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, DatabaseError> {
        self.state.lock().map_err(|_| {
            DatabaseError::new(DatabaseErrorKind::ConnectionError {
                message: "memory store lock poisoned".to_string(),
            })
        })
    }

    /// Stores a record as-is, e.g. one backdated for expiry checks.
    pub fn insert(&self, payment: Payment) -> Result<(), DatabaseError> {
        self.lock()?.payments.insert(payment.id, payment);
        Ok(())
    }

    pub fn grants(&self) -> Vec<(Uuid, EntitlementGrant)> {
        self.lock()
            .map(|state| {
                state
                    .grants
                    .iter()
                    .map(|(id, grant)| (*id, grant.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscription_expiry(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.lock()
            .ok()
            .and_then(|state| state.subscriptions.get(&user_id).copied())
    }

    pub fn has_profile_unlock(&self, user_id: Uuid, target_profile_id: Uuid) -> bool {
        self.lock()
            .map(|state| {
                state
                    .profile_unlocks
                    .contains_key(&(user_id, target_profile_id))
            })
            .unwrap_or(false)
    }

    /// Unexpired credits at `now`.
    pub fn unlock_credits(&self, user_id: Uuid, now: DateTime<Utc>) -> i32 {
        self.lock()
            .map(|state| {
                state
                    .unlock_credits
                    .values()
                    .filter(|(owner, _, expires_at)| *owner == user_id && *expires_at > now)
                    .map(|(_, credits, _)| *credits)
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn apply_grant(state: &mut State, payment_id: Uuid, grant: &EntitlementGrant, now: DateTime<Utc>) {
    if state.grants.contains_key(&payment_id) {
        return;
    }
    match grant {
        EntitlementGrant::Subscription { user_id, days } => {
            let base = state
                .subscriptions
                .get(user_id)
                .copied()
                .filter(|expires_at| *expires_at > now)
                .unwrap_or(now);
            state
                .subscriptions
                .insert(*user_id, base + Duration::days(i64::from(*days)));
        }
        EntitlementGrant::ProfileUnlock {
            user_id,
            target_profile_id,
        } => {
            state
                .profile_unlocks
                .entry((*user_id, *target_profile_id))
                .or_insert(payment_id);
        }
        EntitlementGrant::DailyUnlock {
            user_id,
            credits,
            valid_until,
        } => {
            state
                .unlock_credits
                .insert(payment_id, (*user_id, *credits, *valid_until));
        }
    }
    state.grants.insert(payment_id, grant.clone());
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn create_pending(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
        payment.validate().map_err(DatabaseError::rejected)?;
        let provider_transaction_id = payment.provider_reference();
        let record = Payment {
            id: Uuid::new_v4(),
            user_id: payment.user_id,
            amount: payment.amount,
            currency: payment.currency,
            product_type: payment.product_type,
            target_resource_id: payment.target_resource_id,
            provider_transaction_id,
            status: PaymentStatus::Pending,
            failure_reason: None,
            metadata: payment.metadata,
            created_at: Utc::now(),
            finalized_at: None,
        };

        let mut state = self.lock()?;
        if let Some(reference) = record.provider_transaction_id.as_deref() {
            let taken = state
                .payments
                .values()
                .any(|p| p.provider_transaction_id.as_deref() == Some(reference));
            if taken {
                return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                    constraint: "payments_provider_transaction_id_key".to_string(),
                }));
            }
        }
        state.payments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn attach_provider_reference(
        &self,
        id: Uuid,
        provider_transaction_id: &str,
    ) -> Result<Payment, DatabaseError> {
        let mut state = self.lock()?;
        let payment = state.payments.get_mut(&id).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "Payment".to_string(),
                id: id.to_string(),
            })
        })?;
        if payment.provider_transaction_id.is_none() {
            payment.provider_transaction_id = Some(provider_transaction_id.to_string());
        }
        Ok(payment.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.lock()?.payments.get(&id).cloned())
    }

    async fn find_by_provider_reference(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self
            .lock()?
            .payments
            .values()
            .find(|p| p.provider_transaction_id.as_deref() == Some(provider_transaction_id))
            .cloned())
    }

    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let state = self.lock()?;
        let mut pending: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < cutoff)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(pending)
    }

    async fn settle(
        &self,
        id: Uuid,
        settlement: Settlement,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let payment = match state.payments.get_mut(&id) {
            Some(payment) if payment.status == PaymentStatus::Pending => payment,
            _ => return Ok(None),
        };

        payment.status = settlement.status;
        payment.failure_reason = settlement.failure_reason;
        payment.finalized_at = Some(settlement.finalized_at);
        payment.metadata = merge_metadata(&payment.metadata, &settlement.metadata_patch);
        let settled = payment.clone();

        if let Some(grant) = settlement.grant.as_ref() {
            apply_grant(state, id, grant, settlement.finalized_at);
        }
        Ok(Some(settled))
    }

    async fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut state = self.lock()?;
        let before = state.payments.len();
        state.payments.retain(|_, p| {
            let settled_at = p.finalized_at.unwrap_or(p.created_at);
            !(p.status == PaymentStatus::Failed && settled_at < cutoff)
        });
        Ok((before - state.payments.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        self.lock().map(|_| ())
    }
}
