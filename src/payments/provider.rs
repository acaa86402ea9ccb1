use crate::payments::error::PaymentResult;
use crate::payments::types::{ProviderLookup, WebhookEvent, WebhookVerificationResult};
use async_trait::async_trait;

/// Read side of an external payment aggregator.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Current provider view of `transaction_id`. Errors are transient from
    /// the caller's point of view and are never retried here.
    async fn lookup_transaction(&self, transaction_id: &str) -> PaymentResult<ProviderLookup>;

    fn name(&self) -> &'static str;

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult>;

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::normalize::{LookupBody, ProviderStatus};

    struct MockProvider {
        body: serde_json::Value,
    }

    #[async_trait]
    impl PaymentProvider for MockProvider {
        async fn lookup_transaction(&self, transaction_id: &str) -> PaymentResult<ProviderLookup> {
            let body = LookupBody::from_json(self.body.clone())?;
            let (status, matched) = body.status_for(transaction_id);
            Ok(ProviderLookup {
                transaction_id: transaction_id.to_string(),
                status,
                matched,
                raw: self.body.clone(),
            })
        }

        fn name(&self) -> &'static str {
            "mock"
        }

        fn verify_webhook(
            &self,
            _payload: &[u8],
            _signature: &str,
        ) -> PaymentResult<WebhookVerificationResult> {
            Ok(WebhookVerificationResult {
                valid: true,
                reason: None,
            })
        }

        fn parse_webhook_event(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            Ok(WebhookEvent {
                provider: "mock".to_string(),
                transaction_id: None,
                status: ProviderStatus::Unknown,
                payload: serde_json::json!({}),
                received_at: chrono::Utc::now().to_rfc3339(),
            })
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_provider() {
        let provider: Box<dyn PaymentProvider> = Box::new(MockProvider {
            body: serde_json::json!([
                {"reference": "A", "status": "pending"},
                {"reference": "B", "status": "successful"}
            ]),
        });

        let lookup = provider
            .lookup_transaction("B")
            .await
            .expect("lookup should succeed");
        assert_eq!(lookup.status, ProviderStatus::Success);
        assert!(lookup.matched);
        assert_eq!(provider.name(), "mock");
    }
}
