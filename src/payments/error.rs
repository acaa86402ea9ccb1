use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Failures talking to the aggregator. Every variant except validation and
/// signature failures is transient for reconciliation: the payment stays
/// pending and is looked up again later.
#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("invalid {}: {message}", .field.as_deref().unwrap_or("input"))]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("aggregator unreachable: {message}")]
    NetworkError { message: String },

    #[error("aggregator rate limited the request: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("unreadable aggregator response: {message}")]
    MalformedResponse { message: String },

    #[error("webhook rejected: {message}")]
    WebhookVerificationError { message: String },

    #[error("{provider} answered with an error ({}): {message}", .provider_code.as_deref().unwrap_or("no code"))]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } | PaymentError::WebhookVerificationError { .. } => {
                false
            }
            // Shape drift is usually temporary on the aggregator side.
            PaymentError::NetworkError { .. }
            | PaymentError::RateLimitError { .. }
            | PaymentError::MalformedResponse { .. } => true,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let retryable = err.is_retryable();
        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "payment".to_string()),
                    reason: message,
                })
            }
            PaymentError::WebhookVerificationError { message } => {
                AppErrorKind::External(ExternalError::WebhookSignature { message })
            }
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "mpesa".to_string(),
                retry_after: retry_after_seconds,
            }),
            PaymentError::ProviderError {
                provider, message, ..
            } => AppErrorKind::External(ExternalError::PaymentProvider {
                provider,
                message,
                is_retryable: retryable,
            }),
            other => AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "mpesa".to_string(),
                message: other.to_string(),
                is_retryable: retryable,
            }),
        };

        AppError::new(kind)
    }
}
