use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::normalize::LookupBody;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{ProviderLookup, WebhookEvent, WebhookVerificationResult};
use crate::payments::utils::{verify_hmac_sha256_hex, PaymentHttpClient};
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

const PROVIDER: &str = "mpesa";
const TRANSACTION_PLACEHOLDER: &str = "{transaction_id}";

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub api_key: String,
    /// Path template containing `{transaction_id}` as (part of) one segment.
    pub lookup_path: String,
    pub timeout_secs: u64,
    pub webhook_secret: Option<String>,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            lookup_path: "/v1/transactions/{transaction_id}".to_string(),
            timeout_secs: 15,
            webhook_secret: None,
        }
    }
}

impl MpesaConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let config = Self {
            base_url: std::env::var("MPESA_AGGREGATOR_BASE_URL").unwrap_or_default(),
            api_key: std::env::var("MPESA_AGGREGATOR_API_KEY").unwrap_or_default(),
            lookup_path: std::env::var("MPESA_LOOKUP_PATH").unwrap_or(defaults.lookup_path),
            timeout_secs: std::env::var("MPESA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            webhook_secret: std::env::var("MPESA_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.base_url.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "MPESA_AGGREGATOR_BASE_URL and MPESA_AGGREGATOR_API_KEY are required"
                    .to_string(),
                field: Some("mpesa".to_string()),
            });
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(PaymentError::ValidationError {
                message: "MPESA_AGGREGATOR_BASE_URL must be an http(s) URL".to_string(),
                field: Some("MPESA_AGGREGATOR_BASE_URL".to_string()),
            });
        }
        if !self.lookup_path.contains(TRANSACTION_PLACEHOLDER) {
            return Err(PaymentError::ValidationError {
                message: format!("MPESA_LOOKUP_PATH must contain {}", TRANSACTION_PLACEHOLDER),
                field: Some("MPESA_LOOKUP_PATH".to_string()),
            });
        }
        if self.lookup_path.contains(['?', '#']) {
            return Err(PaymentError::ValidationError {
                message: "MPESA_LOOKUP_PATH must be a plain path".to_string(),
                field: Some("MPESA_LOOKUP_PATH".to_string()),
            });
        }
        if Url::parse(&self.base_url).map_or(true, |url| url.cannot_be_a_base()) {
            return Err(PaymentError::ValidationError {
                message: "MPESA_AGGREGATOR_BASE_URL is not a valid base URL".to_string(),
                field: Some("MPESA_AGGREGATOR_BASE_URL".to_string()),
            });
        }
        if self.timeout_secs == 0 {
            return Err(PaymentError::ValidationError {
                message: "MPESA_TIMEOUT_SECS must be positive".to_string(),
                field: Some("MPESA_TIMEOUT_SECS".to_string()),
            });
        }
        Ok(())
    }
}

/// M-Pesa collections through an aggregator's transaction lookup API.
pub struct MpesaProvider {
    config: MpesaConfig,
    http: PaymentHttpClient,
}

impl MpesaProvider {
    pub fn new(config: MpesaConfig) -> PaymentResult<Self> {
        config.validate()?;
        let http = PaymentHttpClient::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(MpesaConfig::from_env()?)
    }

    /// Each template segment is pushed separately so the transaction id is
    /// percent-encoded and can never add segments, a query or a fragment.
    fn lookup_url(&self, transaction_id: &str) -> PaymentResult<Url> {
        let invalid_base = || PaymentError::ValidationError {
            message: "MPESA_AGGREGATOR_BASE_URL is not a valid base URL".to_string(),
            field: Some("MPESA_AGGREGATOR_BASE_URL".to_string()),
        };
        let mut url = Url::parse(&self.config.base_url).map_err(|_| invalid_base())?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| invalid_base())?;
            segments.pop_if_empty();
            for segment in self.config.lookup_path.split('/').filter(|s| !s.is_empty()) {
                segments.push(&segment.replace(TRANSACTION_PLACEHOLDER, transaction_id.trim()));
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    async fn lookup_transaction(&self, transaction_id: &str) -> PaymentResult<ProviderLookup> {
        if transaction_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "transaction id is required".to_string(),
                field: Some("transaction_id".to_string()),
            });
        }

        let raw = self
            .http
            .get_json(
                self.lookup_url(transaction_id)?.as_str(),
                Some(&self.config.api_key),
                &[],
            )
            .await
            .map_err(|e| match e {
                PaymentError::ProviderError {
                    message,
                    provider_code,
                    retryable,
                    ..
                } => PaymentError::ProviderError {
                    provider: PROVIDER.to_string(),
                    message,
                    provider_code,
                    retryable,
                },
                other => other,
            })?;

        let body = LookupBody::from_json(raw.clone())?;
        let (status, matched) = body.status_for(transaction_id);
        if !matched {
            warn!(
                transaction_id = %transaction_id,
                "mpesa lookup returned no record for transaction"
            );
        }
        debug!(transaction_id = %transaction_id, status = %status, "mpesa lookup normalized");

        Ok(ProviderLookup {
            transaction_id: transaction_id.to_string(),
            status,
            matched,
            raw,
        })
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let secret = match self.config.webhook_secret.as_deref() {
            Some(secret) => secret,
            None => {
                return Ok(WebhookVerificationResult {
                    valid: false,
                    reason: Some("MPESA_WEBHOOK_SECRET is not configured".to_string()),
                })
            }
        };

        let valid = verify_hmac_sha256_hex(payload, secret, signature);
        Ok(WebhookVerificationResult {
            valid,
            reason: (!valid).then(|| "signature mismatch".to_string()),
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| PaymentError::MalformedResponse {
                message: format!("invalid webhook JSON: {}", e),
            })?;

        let body = LookupBody::from_json(parsed.clone())?;
        let record = match &body {
            LookupBody::Single(record) => Some(record),
            LookupBody::Batch(records) => records.iter().find(|r| r.primary_id().is_some()),
        };

        Ok(WebhookEvent {
            provider: PROVIDER.to_string(),
            transaction_id: record.and_then(|r| r.primary_id()).map(str::to_string),
            status: record
                .map(|r| r.status())
                .unwrap_or(crate::payments::normalize::ProviderStatus::Unknown),
            payload: parsed,
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::normalize::ProviderStatus;

    fn config() -> MpesaConfig {
        MpesaConfig {
            base_url: "https://aggregator.example.com/".to_string(),
            api_key: "key".to_string(),
            webhook_secret: Some("whsec".to_string()),
            ..MpesaConfig::default()
        }
    }

    #[test]
    fn lookup_url_substitutes_transaction_id() {
        let provider = MpesaProvider::new(config()).unwrap();
        assert_eq!(
            provider.lookup_url("TX-9").unwrap().as_str(),
            "https://aggregator.example.com/v1/transactions/TX-9"
        );
    }

    #[test]
    fn lookup_url_encodes_reserved_characters_in_transaction_id() {
        let provider = MpesaProvider::new(config()).unwrap();
        let url = provider.lookup_url("../admin?x=1#frag").unwrap();

        assert_eq!(url.path(), "/v1/transactions/..%2Fadmin%3Fx=1%23frag");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(url.path_segments().map(|s| s.count()), Some(3));
    }

    #[test]
    fn lookup_url_keeps_base_path_prefix() {
        let mut cfg = config();
        cfg.base_url = "https://aggregator.example.com/api".to_string();
        let provider = MpesaProvider::new(cfg).unwrap();
        assert_eq!(
            provider.lookup_url("TX-1").unwrap().as_str(),
            "https://aggregator.example.com/api/v1/transactions/TX-1"
        );
    }

    #[test]
    fn config_requires_placeholder_and_credentials() {
        let mut cfg = config();
        cfg.lookup_path = "/v1/transactions".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.api_key = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.base_url = "aggregator.example.com".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.lookup_path = "/v1/transactions?id={transaction_id}".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn webhook_is_rejected_without_secret() {
        let mut cfg = config();
        cfg.webhook_secret = None;
        let provider = MpesaProvider::new(cfg).unwrap();
        let result = provider.verify_webhook(b"{}", "abc").unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn webhook_event_extracts_id_and_status() {
        let provider = MpesaProvider::new(config()).unwrap();
        let event = provider
            .parse_webhook_event(br#"{"event":"payment.updated","data":{"transaction_id":"TX-5","status":"Completed"}}"#)
            .unwrap();
        assert_eq!(event.transaction_id.as_deref(), Some("TX-5"));
        assert_eq!(event.status, ProviderStatus::Success);
        assert_eq!(event.provider, "mpesa");
    }

    #[test]
    fn webhook_event_rejects_invalid_json() {
        let provider = MpesaProvider::new(config()).unwrap();
        assert!(provider.parse_webhook_event(b"not json").is_err());
    }
}
