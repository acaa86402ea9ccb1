use crate::config::PaymentsConfig;
use crate::database::memory_store::MemoryPaymentStore;
use crate::database::repository::PaymentStore;
use crate::payments::providers::mpesa::{MpesaConfig, MpesaProvider};
use crate::payments::types::{NewPayment, PaymentStatus, ProductType};
use crate::services::finalization::FinalizationEngine;
use crate::services::webhook_processor::{
    WebhookOutcome, WebhookProcessor, WebhookProcessorError,
};
use bigdecimal::BigDecimal;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

const SECRET: &str = "whsec_test";

fn sign(payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn processor(store: Arc<MemoryPaymentStore>) -> WebhookProcessor {
    let provider = MpesaProvider::new(MpesaConfig {
        base_url: "https://aggregator.example.com".to_string(),
        api_key: "key".to_string(),
        webhook_secret: Some(SECRET.to_string()),
        ..MpesaConfig::default()
    })
    .unwrap();
    let engine = Arc::new(FinalizationEngine::new(
        store.clone(),
        PaymentsConfig::default(),
    ));
    WebhookProcessor::new(store, Arc::new(provider), engine)
}

async fn pending_subscription(store: &MemoryPaymentStore, reference: &str) -> Uuid {
    store
        .create_pending(NewPayment {
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from(499),
            currency: "KES".to_string(),
            product_type: ProductType::Subscription,
            target_resource_id: None,
            provider_transaction_id: Some(reference.to_string()),
            metadata: json!({}),
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_invalid_signature_is_rejected() {
    let store = Arc::new(MemoryPaymentStore::new());
    let payment_id = pending_subscription(&store, "TX-100").await;
    let processor = processor(store.clone());
    let payload = br#"{"transaction_id":"TX-100","status":"success"}"#;

    let err = processor
        .process_webhook(Some("deadbeef"), payload)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature));

    let err = processor.process_webhook(None, payload).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature));

    let payment = store.find_by_id(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_success_webhook_finalizes_once() {
    let store = Arc::new(MemoryPaymentStore::new());
    let payment_id = pending_subscription(&store, "TX-200").await;
    let processor = processor(store.clone());
    let payload = br#"{"event":"payment.updated","data":{"transaction_id":"TX-200","status":"Paid"}}"#;
    let signature = sign(payload);

    let first = processor
        .process_webhook(Some(&signature), payload)
        .await
        .unwrap();
    let replay = processor
        .process_webhook(Some(&signature), payload)
        .await
        .unwrap();

    assert_eq!(
        first,
        WebhookOutcome::Finalized {
            payment_id,
            status: PaymentStatus::Completed
        }
    );
    assert_eq!(
        replay,
        WebhookOutcome::AlreadySettled {
            payment_id,
            status: PaymentStatus::Completed
        }
    );
    assert_eq!(store.grants().len(), 1);

    let payment = store.find_by_id(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.metadata["finalized_by"], "webhook");
    assert_eq!(payment.metadata["provider_status"], "success");
}

#[tokio::test]
async fn test_webhook_matches_reference_recorded_in_metadata() {
    let store = Arc::new(MemoryPaymentStore::new());
    let payment_id = store
        .create_pending(NewPayment {
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from(499),
            currency: "KES".to_string(),
            product_type: ProductType::Subscription,
            target_resource_id: None,
            provider_transaction_id: None,
            metadata: json!({"checkout_request_id": "ws_CO_900"}),
        })
        .await
        .unwrap()
        .id;
    let processor = processor(store.clone());
    let payload = br#"{"transaction_id":"ws_CO_900","status":"success"}"#;

    let outcome = processor
        .process_webhook(Some(&sign(payload)), payload)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        WebhookOutcome::Finalized {
            payment_id,
            status: PaymentStatus::Completed
        }
    );
}

#[tokio::test]
async fn test_failed_webhook_marks_payment_failed() {
    let store = Arc::new(MemoryPaymentStore::new());
    let payment_id = pending_subscription(&store, "TX-300").await;
    let processor = processor(store.clone());
    let payload = br#"{"transaction_id":"TX-300","status":"CANCELLED"}"#;

    let outcome = processor
        .process_webhook(Some(&sign(payload)), payload)
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        WebhookOutcome::Finalized {
            status: PaymentStatus::Failed,
            ..
        }
    ));
    let payment = store.find_by_id(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.failure_reason.as_deref(), Some("provider_failed"));
    assert!(store.grants().is_empty());
}

#[tokio::test]
async fn test_pending_and_unknown_events_are_ignored() {
    let store = Arc::new(MemoryPaymentStore::new());
    let payment_id = pending_subscription(&store, "TX-400").await;
    let processor = processor(store.clone());

    for payload in [
        br#"{"transaction_id":"TX-400","status":"processing"}"#.as_slice(),
        br#"{"transaction_id":"TX-999","status":"success"}"#.as_slice(),
        br#"{"status":"success"}"#.as_slice(),
    ] {
        let outcome = processor
            .process_webhook(Some(&sign(payload)), payload)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
    }

    let payment = store.find_by_id(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_malformed_payload_is_reported() {
    let store = Arc::new(MemoryPaymentStore::new());
    let processor = processor(store);
    let payload = b"not-json";

    let err = processor
        .process_webhook(Some(&sign(payload)), payload)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::MalformedPayload(_)));
}
