//! Unified error handling for the payments backend
//!
//! Every module error converts into [`AppError`], which carries the HTTP
//! status, a machine-readable [`ErrorCode`] and a user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable codes clients branch on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "PAYMENT_FORBIDDEN")]
    PaymentForbidden,
    #[serde(rename = "UNAUTHENTICATED")]
    Unauthenticated,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "WEBHOOK_SIGNATURE_INVALID")]
    WebhookSignatureInvalid,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,

    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Lookup and ownership failures.
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Payment with given ID doesn't exist
    PaymentNotFound { payment_id: String },
    /// Payment belongs to another account
    PaymentForbidden { payment_id: String },
    /// Caller identity missing or unparseable
    Unauthenticated,
}

/// Failures on our side of the wire.
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration, including payment records that
    /// lack data the reconciliation flow cannot proceed without.
    Configuration { message: String },
}

/// Aggregator-facing failures.
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    WebhookSignature { message: String },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
}

/// Malformed request input.
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidField { field: String, reason: String },
}

/// What every handler returns on failure.
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::PaymentForbidden { .. } => 403,
                DomainError::Unauthenticated => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502,
                ExternalError::WebhookSignature { .. } => 401,
                ExternalError::RateLimit { .. } => 429,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::PaymentForbidden { .. } => ErrorCode::PaymentForbidden,
                DomainError::Unauthenticated => ErrorCode::Unauthenticated,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::WebhookSignature { .. } => ErrorCode::WebhookSignatureInvalid,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Safe to show to the end user.
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { payment_id } => {
                    format!("Payment '{}' not found", payment_id)
                }
                DomainError::PaymentForbidden { .. } => {
                    "You do not have access to this payment".to_string()
                }
                DomainError::Unauthenticated => "Authentication required".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::WebhookSignature { .. } => "Invalid webhook signature".to_string(),
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::WebhookSignature { .. } => false,
                ExternalError::RateLimit { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }

    /// Internal detail for logs; never sent to clients.
    pub fn log_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Infrastructure(InfrastructureError::Database { message, .. })
            | AppErrorKind::Infrastructure(InfrastructureError::Configuration { message })
            | AppErrorKind::External(ExternalError::PaymentProvider { message, .. })
            | AppErrorKind::External(ExternalError::WebhookSignature { message }) => {
                message.clone()
            }
            _ => self.user_message(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, service errors convert in
// their own modules.
