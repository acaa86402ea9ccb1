#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use swipepay_backend::config::PaymentsConfig;
use swipepay_backend::database::memory_store::MemoryPaymentStore;
use swipepay_backend::database::repository::PaymentStore;
use swipepay_backend::payments::error::{PaymentError, PaymentResult};
use swipepay_backend::payments::normalize::{LookupBody, ProviderStatus};
use swipepay_backend::payments::provider::PaymentProvider;
use swipepay_backend::payments::types::{
    NewPayment, Payment, ProductType, ProviderLookup, WebhookEvent, WebhookVerificationResult,
};
use swipepay_backend::services::{FinalizationEngine, StatusRefreshService};
use uuid::Uuid;

pub const VALID_SIGNATURE: &str = "valid-signature";

/// Provider answering lookups from per-reference scripts. The last scripted
/// response repeats; unscripted references fail with a network error.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<PaymentResult<JsonValue>>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, reference: &str, body: JsonValue) {
        self.push(reference, Ok(body));
    }

    pub fn fail(&self, reference: &str) {
        self.push(
            reference,
            Err(PaymentError::NetworkError {
                message: "connection reset".to_string(),
            }),
        );
    }

    fn push(&self, reference: &str, response: PaymentResult<JsonValue>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(reference.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self, reference: &str) -> PaymentResult<JsonValue> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(reference) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Err(PaymentError::NetworkError {
                message: format!("no script for {}", reference),
            }),
        }
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    async fn lookup_transaction(&self, transaction_id: &str) -> PaymentResult<ProviderLookup> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let raw = self.next(transaction_id)?;
        let (status, matched) = LookupBody::from_json(raw.clone())?.status_for(transaction_id);
        Ok(ProviderLookup {
            transaction_id: transaction_id.to_string(),
            status,
            matched,
            raw,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn verify_webhook(
        &self,
        _payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let valid = signature == VALID_SIGNATURE;
        Ok(WebhookVerificationResult {
            valid,
            reason: (!valid).then(|| "signature mismatch".to_string()),
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let payload: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::MalformedResponse {
                message: e.to_string(),
            })?;
        let body = LookupBody::from_json(payload.clone())?;
        let record = match &body {
            LookupBody::Single(record) => Some(record),
            LookupBody::Batch(records) => records.first(),
        };
        Ok(WebhookEvent {
            provider: "scripted".to_string(),
            transaction_id: record.and_then(|r| r.primary_id()).map(str::to_string),
            status: record
                .map(|r| r.status())
                .unwrap_or(ProviderStatus::Unknown),
            payload,
            received_at: Utc::now().to_rfc3339(),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryPaymentStore>,
    pub provider: Arc<ScriptedProvider>,
    pub engine: Arc<FinalizationEngine>,
    pub refresh: Arc<StatusRefreshService>,
    pub config: PaymentsConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PaymentsConfig::default())
    }

    pub fn with_config(config: PaymentsConfig) -> Self {
        let store = Arc::new(MemoryPaymentStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let engine = Arc::new(FinalizationEngine::new(store.clone(), config.clone()));
        let refresh = Arc::new(StatusRefreshService::new(
            store.clone(),
            provider.clone(),
            engine.clone(),
            config.clone(),
        ));
        Self {
            store,
            provider,
            engine,
            refresh,
            config,
        }
    }

    pub async fn pending(&self, product_type: ProductType, reference: &str) -> Payment {
        let target_resource_id = match product_type {
            ProductType::ProfileUnlock => Some(Uuid::new_v4()),
            _ => None,
        };
        self.store
            .create_pending(NewPayment {
                user_id: Uuid::new_v4(),
                amount: BigDecimal::from(100),
                currency: "KES".to_string(),
                product_type,
                target_resource_id,
                provider_transaction_id: Some(reference.to_string()),
                metadata: json!({ "phone": "+254712345678" }),
            })
            .await
            .unwrap()
    }

    /// Moves `created_at` back so the payment looks `secs` old.
    pub fn backdate(&self, payment: &Payment, secs: i64) -> Payment {
        let mut aged = payment.clone();
        aged.created_at = Utc::now() - ChronoDuration::seconds(secs);
        self.store.insert(aged.clone()).unwrap();
        aged
    }
}
