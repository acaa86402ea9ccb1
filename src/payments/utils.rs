use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

/// Thin JSON client for provider calls.
///
/// Requests are single-shot: a failed lookup is reported to the caller,
/// which decides whether to poll again.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self { client, timeout })
    }

    pub async fn get_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<JsonValue> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header("Accept", "application/json");

        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| PaymentError::NetworkError {
                message: format!("provider request failed: {}", e),
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = resp.text().await.map_err(|e| PaymentError::NetworkError {
            message: format!("failed to read provider response: {}", e),
        })?;
        debug!(status = %status, bytes = text.len(), "provider responded");

        if status.is_success() {
            return serde_json::from_str::<JsonValue>(&text).map_err(|e| {
                PaymentError::MalformedResponse {
                    message: format!("invalid provider JSON response: {}", e),
                }
            });
        }

        if status.as_u16() == 429 {
            return Err(PaymentError::RateLimitError {
                message: "provider rate limit exceeded".to_string(),
                retry_after_seconds: retry_after,
            });
        }

        Err(PaymentError::ProviderError {
            provider: "http".to_string(),
            message: format!("HTTP {}: {}", status, truncate(&text, 256)),
            provider_code: Some(status.as_u16().to_string()),
            retryable: status.is_server_error(),
        })
    }
}

pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());
    secure_eq(
        computed.as_bytes(),
        signature.trim().to_ascii_lowercase().as_bytes(),
    )
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
