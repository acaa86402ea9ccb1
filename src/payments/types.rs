use crate::payments::error::PaymentError;
use crate::payments::normalize::ProviderStatus;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Metadata keys that may carry the provider transaction id when the
/// dedicated column has not been populated yet.
pub const PROVIDER_REFERENCE_KEYS: [&str; 3] = [
    "provider_transaction_id",
    "transaction_id",
    "checkout_request_id",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Subscription,
    ProfileUnlock,
    DailyUnlock,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Subscription => "subscription",
            ProductType::ProfileUnlock => "profile_unlock",
            ProductType::DailyUnlock => "daily_unlock",
        }
    }

    pub fn requires_target(&self) -> bool {
        matches!(self, ProductType::ProfileUnlock)
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "subscription" => Ok(ProductType::Subscription),
            "profile_unlock" => Ok(ProductType::ProfileUnlock),
            "daily_unlock" => Ok(ProductType::DailyUnlock),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported product type: {}", value),
                field: Some("product_type".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown payment status: {}", value),
                field: Some("status".to_string()),
            }),
        }
    }
}

/// A premium-feature charge and its reconciliation state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub product_type: ProductType,
    pub target_resource_id: Option<Uuid>,
    pub provider_transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time left in the verification window at `now`, floored at zero.
    pub fn time_remaining(&self, window: Duration, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - self.created_at).to_std().unwrap_or_default();
        window.saturating_sub(elapsed)
    }

    /// Provider transaction id from the dedicated column, falling back to
    /// metadata written by the initiation step.
    pub fn provider_reference(&self) -> Option<String> {
        reference_in(self.provider_transaction_id.as_deref(), &self.metadata)
    }
}

fn reference_in(column: Option<&str>, metadata: &JsonValue) -> Option<String> {
    if let Some(reference) = column.filter(|v| !v.trim().is_empty()) {
        return Some(reference.to_string());
    }
    PROVIDER_REFERENCE_KEYS.iter().find_map(|key| {
        metadata
            .get(*key)
            .and_then(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
    })
}

/// Record handed to the store by the initiation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub product_type: ProductType,
    pub target_resource_id: Option<Uuid>,
    pub provider_transaction_id: Option<String>,
    pub metadata: JsonValue,
}

impl NewPayment {
    /// Reference the store should index, promoted from metadata when the
    /// initiation step only recorded it there.
    pub fn provider_reference(&self) -> Option<String> {
        reference_in(self.provider_transaction_id.as_deref(), &self.metadata)
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.amount <= BigDecimal::from(0) {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "currency is required".to_string(),
                field: Some("currency".to_string()),
            });
        }
        match (self.product_type.requires_target(), self.target_resource_id) {
            (true, None) => Err(PaymentError::ValidationError {
                message: "profile unlocks require a target profile".to_string(),
                field: Some("target_resource_id".to_string()),
            }),
            (false, Some(_)) => Err(PaymentError::ValidationError {
                message: format!("{} payments do not take a target", self.product_type),
                field: Some("target_resource_id".to_string()),
            }),
            _ => Ok(()),
        }
    }
}

/// Normalized answer from a provider transaction lookup.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderLookup {
    pub transaction_id: String,
    pub status: ProviderStatus,
    /// Whether a batch response contained an element for this transaction.
    pub matched: bool,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub provider: String,
    pub transaction_id: Option<String>,
    pub status: ProviderStatus,
    pub payload: JsonValue,
    pub received_at: String,
}
