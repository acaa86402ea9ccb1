use crate::database::error::DatabaseError;
use crate::payments::types::{NewPayment, Payment, PaymentStatus, ProductType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Entitlement applied together with a successful settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntitlementGrant {
    /// Extend the subscription from `max(expires_at, now)`.
    Subscription { user_id: Uuid, days: i32 },
    ProfileUnlock {
        user_id: Uuid,
        target_profile_id: Uuid,
    },
    DailyUnlock {
        user_id: Uuid,
        credits: i32,
        valid_until: DateTime<Utc>,
    },
}

impl EntitlementGrant {
    pub fn user_id(&self) -> Uuid {
        match self {
            EntitlementGrant::Subscription { user_id, .. }
            | EntitlementGrant::ProfileUnlock { user_id, .. }
            | EntitlementGrant::DailyUnlock { user_id, .. } => *user_id,
        }
    }

    pub fn product_type(&self) -> ProductType {
        match self {
            EntitlementGrant::Subscription { .. } => ProductType::Subscription,
            EntitlementGrant::ProfileUnlock { .. } => ProductType::ProfileUnlock,
            EntitlementGrant::DailyUnlock { .. } => ProductType::DailyUnlock,
        }
    }
}

/// Terminal transition requested by the finalization engine.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub finalized_at: DateTime<Utc>,
    /// Shallow-merged into the stored metadata object.
    pub metadata_patch: JsonValue,
    pub grant: Option<EntitlementGrant>,
}

/// Persistence contract for payment records.
///
/// `settle` is the only write that changes `status`. Implementations must
/// apply the status flip and the grant atomically, and only while the row is
/// still `pending`; `Ok(None)` means another caller settled it first.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create_pending(&self, payment: NewPayment) -> Result<Payment, DatabaseError>;

    /// Sets `provider_transaction_id` when it is still empty. Returns the
    /// stored record either way.
    async fn attach_provider_reference(
        &self,
        id: Uuid,
        provider_transaction_id: &str,
    ) -> Result<Payment, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    async fn find_by_provider_reference(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Oldest first.
    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, DatabaseError>;

    async fn settle(
        &self,
        id: Uuid,
        settlement: Settlement,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Deletes `failed` rows finalized (or created, when never finalized)
    /// before `cutoff`.
    async fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>;

    async fn health_check(&self) -> Result<(), DatabaseError>;
}

/// Shallow merge of two JSON objects. Non-object bases are replaced.
pub fn merge_metadata(base: &JsonValue, patch: &JsonValue) -> JsonValue {
    match (base, patch) {
        (JsonValue::Object(base), JsonValue::Object(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            JsonValue::Object(merged)
        }
        (_, JsonValue::Object(_)) => patch.clone(),
        (base, _) => base.clone(),
    }
}
