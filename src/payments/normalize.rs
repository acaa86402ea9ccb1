//! Normalization of aggregator transaction responses.
//!
//! Aggregators do not agree on a response shape: some answer a lookup with a
//! single transaction object, others with an array of recent transactions,
//! and the status field moves between `status`, `data.status`,
//! `payment_link.status` and `payment.status`. Responses are decoded into
//! [`LookupBody`] and reduced to a [`ProviderStatus`].

use crate::payments::error::{PaymentError, PaymentResult};
use serde::Serialize;
use serde_json::Value as JsonValue;

const SUCCESS_STATUSES: [&str; 4] = ["success", "successful", "paid", "completed"];
const FAILED_STATUSES: [&str; 4] = ["failed", "cancelled", "canceled", "expired"];

/// Keys that identify a transaction inside a record, in lookup order.
const ID_KEYS: [&str; 6] = [
    "transaction_id",
    "transactionId",
    "id",
    "reference",
    "checkout_request_id",
    "CheckoutRequestID",
];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Success,
    Failed,
    /// No interpretable status field was found.
    Unknown,
}

impl ProviderStatus {
    /// Map an already lowercased provider status string.
    pub fn from_raw(raw: &str) -> Self {
        if SUCCESS_STATUSES.contains(&raw) {
            ProviderStatus::Success
        } else if FAILED_STATUSES.contains(&raw) {
            ProviderStatus::Failed
        } else {
            ProviderStatus::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Success => "success",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderStatus::Success | ProviderStatus::Failed)
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Nested object that may carry its own status (`data`, `payment`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusEnvelope {
    pub status: Option<String>,
    pub ids: Vec<String>,
}

impl StatusEnvelope {
    fn from_json(value: &JsonValue) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        Some(Self {
            status: string_field(value, "status"),
            ids: collect_ids(value),
        })
    }
}

/// One candidate transaction as returned by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub ids: Vec<String>,
    pub status: Option<String>,
    pub data: Option<StatusEnvelope>,
    pub payment_link: Option<StatusEnvelope>,
    pub payment: Option<StatusEnvelope>,
    pub raw: JsonValue,
}

impl TransactionRecord {
    pub fn from_json(value: JsonValue) -> Self {
        let envelope = |key: &str| value.get(key).and_then(StatusEnvelope::from_json);
        Self {
            ids: collect_ids(&value),
            status: string_field(&value, "status"),
            data: envelope("data"),
            payment_link: envelope("payment_link"),
            payment: envelope("payment"),
            raw: value,
        }
    }

    pub fn matches(&self, transaction_id: &str) -> bool {
        self.ids.iter().any(|id| id == transaction_id)
            || self
                .data
                .as_ref()
                .is_some_and(|d| d.ids.iter().any(|id| id == transaction_id))
    }

    /// First transaction id found on the record or its `data` envelope.
    pub fn primary_id(&self) -> Option<&str> {
        self.ids
            .first()
            .or_else(|| self.data.as_ref().and_then(|d| d.ids.first()))
            .map(String::as_str)
    }

    /// First non-empty status among the known paths, lowercased.
    pub fn raw_status(&self) -> Option<String> {
        [
            self.status.as_ref(),
            self.data.as_ref().and_then(|e| e.status.as_ref()),
            self.payment_link.as_ref().and_then(|e| e.status.as_ref()),
            self.payment.as_ref().and_then(|e| e.status.as_ref()),
        ]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_lowercase)
    }

    pub fn status(&self) -> ProviderStatus {
        self.raw_status()
            .map(|raw| ProviderStatus::from_raw(&raw))
            .unwrap_or(ProviderStatus::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupBody {
    Single(TransactionRecord),
    Batch(Vec<TransactionRecord>),
}

impl LookupBody {
    pub fn from_json(value: JsonValue) -> PaymentResult<Self> {
        match value {
            JsonValue::Array(items) => Ok(LookupBody::Batch(
                items.into_iter().map(TransactionRecord::from_json).collect(),
            )),
            JsonValue::Object(_) => Ok(LookupBody::Single(TransactionRecord::from_json(value))),
            other => Err(PaymentError::MalformedResponse {
                message: format!("expected a JSON object or array, got {}", json_kind(&other)),
            }),
        }
    }

    /// The record describing `transaction_id`. A single object is always
    /// taken as the answer; a batch only yields an exact id match.
    pub fn select(&self, transaction_id: &str) -> Option<&TransactionRecord> {
        match self {
            LookupBody::Single(record) => Some(record),
            LookupBody::Batch(records) => records.iter().find(|r| r.matches(transaction_id)),
        }
    }

    /// Normalized status for `transaction_id` plus whether a batch element matched.
    pub fn status_for(&self, transaction_id: &str) -> (ProviderStatus, bool) {
        match self.select(transaction_id) {
            Some(record) => (record.status(), true),
            // The raw batch carries no status paths of its own.
            None => (ProviderStatus::Unknown, false),
        }
    }
}

/// Status of a single provider-shaped JSON value.
pub fn normalize_status(value: &JsonValue) -> ProviderStatus {
    match LookupBody::from_json(value.clone()) {
        Ok(LookupBody::Single(record)) => record.status(),
        _ => ProviderStatus::Unknown,
    }
}

fn string_field(value: &JsonValue, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn collect_ids(value: &JsonValue) -> Vec<String> {
    ID_KEYS
        .iter()
        .filter_map(|key| match value.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
