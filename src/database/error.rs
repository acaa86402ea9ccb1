use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError, ValidationError};
use crate::payments::error::PaymentError;
use thiserror::Error;

#[derive(Debug, Clone)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    ConnectionError { message: String },
    UniqueViolation { constraint: String },
    /// Record refused before it reached storage.
    Rejected { field: String, message: String },
    /// Stored value that no longer maps onto a domain type.
    Decode { message: String },
    QueryError { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{}", describe(&self.kind))]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

fn describe(kind: &DatabaseErrorKind) -> String {
    match kind {
        DatabaseErrorKind::NotFound { entity, id } => format!("{} '{}' not found", entity, id),
        DatabaseErrorKind::ConnectionError { message } => {
            format!("database connection error: {}", message)
        }
        DatabaseErrorKind::UniqueViolation { constraint } => {
            format!("unique constraint violated: {}", constraint)
        }
        DatabaseErrorKind::Rejected { field, message } => {
            format!("record rejected, {}: {}", field, message)
        }
        DatabaseErrorKind::Decode { message } => format!("failed to decode row: {}", message),
        DatabaseErrorKind::QueryError { message } => format!("query failed: {}", message),
        DatabaseErrorKind::Unknown { message } => message.clone(),
    }
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn rejected(err: PaymentError) -> Self {
        let (field, message) = match err {
            PaymentError::ValidationError { message, field } => {
                (field.unwrap_or_else(|| "payment".to_string()), message)
            }
            other => ("payment".to_string(), other.to_string()),
        };
        Self::new(DatabaseErrorKind::Rejected { field, message })
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::Decode {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                }
            }
            sqlx::Error::Database(_) => DatabaseErrorKind::QueryError {
                message: err.to_string(),
            },
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self { kind }
    }

    /// Connection-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::ConnectionError { .. })
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        match err.kind {
            DatabaseErrorKind::NotFound { entity, id } if entity == "Payment" => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
                    payment_id: id,
                }))
            }
            DatabaseErrorKind::Rejected { field, message } => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
                    field,
                    reason: message,
                }))
            }
            _ => {
                let is_retryable = err.is_retryable();
                AppError::new(AppErrorKind::Infrastructure(
                    InfrastructureError::Database {
                        message: err.to_string(),
                        is_retryable,
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        let err = DatabaseError::new(DatabaseErrorKind::ConnectionError {
            message: "refused".to_string(),
        });
        assert!(err.is_retryable());

        let err = DatabaseError::new(DatabaseErrorKind::Decode {
            message: "bad status".to_string(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_payment_maps_to_not_found() {
        let app: AppError = DatabaseError::new(DatabaseErrorKind::NotFound {
            entity: "Payment".to_string(),
            id: "abc".to_string(),
        })
        .into();
        assert_eq!(app.status_code(), 404);

        let app: AppError = DatabaseError::new(DatabaseErrorKind::QueryError {
            message: "syntax".to_string(),
        })
        .into();
        assert_eq!(app.status_code(), 500);
        assert!(!app.is_retryable());
    }

    #[test]
    fn rejected_record_maps_to_validation_error() {
        let err = DatabaseError::rejected(PaymentError::ValidationError {
            message: "profile unlocks require a target profile".to_string(),
            field: Some("target_resource_id".to_string()),
        });
        assert!(matches!(
            &err.kind,
            DatabaseErrorKind::Rejected { field, .. } if field == "target_resource_id"
        ));
        assert!(!err.is_retryable());

        let app: AppError = err.into();
        assert_eq!(app.status_code(), 400);
    }
}
