//! Environment-driven settings. `.env` is honoured for local runs.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when running against the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub payments: PaymentsConfig,
    pub skip_externals: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Seconds.
    pub connection_timeout: u64,
    /// Seconds.
    pub idle_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Reconciliation timing and entitlement sizing.
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    /// How long a pending payment may wait for provider confirmation.
    pub verification_window: Duration,
    pub subscription_period_days: i32,
    pub daily_unlock_credits: i32,
    pub daily_unlock_validity: Duration,
    pub poll_interval: Duration,
    pub poll_max_backoff: Duration,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            verification_window: Duration::from_secs(180),
            subscription_period_days: 30,
            daily_unlock_credits: 10,
            daily_unlock_validity: Duration::from_secs(24 * 3600),
            poll_interval: Duration::from_secs(3),
            poll_max_backoff: Duration::from_secs(30),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        _ => Ok(default),
    }
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let skip_externals = flag("SKIP_EXTERNALS");
        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            logging: LoggingConfig::from_env()?,
            payments: PaymentsConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.payments.validate()?;

        Ok(())
    }
}

fn ensure(condition: bool, err: impl FnOnce() -> ConfigError) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(err())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("SERVER_PORT", 8080)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.port != 0, || {
            ConfigError::InvalidValue("SERVER_PORT must be non-zero".to_string())
        })?;
        ensure(!self.host.trim().is_empty(), || {
            ConfigError::InvalidValue("SERVER_HOST is blank".to_string())
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVariable("DATABASE_URL".to_string()))?;
        Ok(Self {
            url,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", 1)?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: parse_var("DB_IDLE_TIMEOUT", 600)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            ["postgres://", "postgresql://"]
                .iter()
                .any(|scheme| self.url.starts_with(scheme)),
            || ConfigError::InvalidValue("DATABASE_URL is not a postgres URL".to_string()),
        )?;
        ensure(self.max_connections > 0, || {
            ConfigError::InvalidValue("DB_MAX_CONNECTIONS must be positive".to_string())
        })?;
        ensure(self.min_connections <= self.max_connections, || {
            ConfigError::ValidationFailed(format!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                self.min_connections, self.max_connections
            ))
        })
    }
}

impl LoggingConfig {
    const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn from_env() -> Result<Self, ConfigError> {
        let format = match env::var("LOG_FORMAT").map(|v| v.trim().to_lowercase()) {
            Ok(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        };
        Ok(Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            Self::LEVELS.contains(&self.level.trim().to_lowercase().as_str()),
            || ConfigError::InvalidValue(format!("LOG_LEVEL {:?}", self.level)),
        )
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(PaymentsConfig {
            verification_window: Duration::from_secs(parse_var(
                "PAYMENT_VERIFICATION_WINDOW_SECONDS",
                defaults.verification_window.as_secs(),
            )?),
            subscription_period_days: parse_var(
                "SUBSCRIPTION_PERIOD_DAYS",
                defaults.subscription_period_days,
            )?,
            daily_unlock_credits: parse_var("DAILY_UNLOCK_CREDITS", defaults.daily_unlock_credits)?,
            daily_unlock_validity: Duration::from_secs(
                parse_var(
                    "DAILY_UNLOCK_VALIDITY_HOURS",
                    defaults.daily_unlock_validity.as_secs() / 3600,
                )? * 3600,
            ),
            poll_interval: Duration::from_secs(parse_var(
                "PAYMENT_POLL_INTERVAL_SECONDS",
                defaults.poll_interval.as_secs(),
            )?),
            poll_max_backoff: Duration::from_secs(parse_var(
                "PAYMENT_POLL_MAX_BACKOFF_SECONDS",
                defaults.poll_max_backoff.as_secs(),
            )?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.verification_window.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_VERIFICATION_WINDOW_SECONDS must be > 0".to_string(),
            ));
        }
        if self.subscription_period_days <= 0 {
            return Err(ConfigError::InvalidValue(
                "SUBSCRIPTION_PERIOD_DAYS must be > 0".to_string(),
            ));
        }
        if self.daily_unlock_credits <= 0 {
            return Err(ConfigError::InvalidValue(
                "DAILY_UNLOCK_CREDITS must be > 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_POLL_INTERVAL_SECONDS must be > 0".to_string(),
            ));
        }
        if self.poll_max_backoff < self.poll_interval {
            return Err(ConfigError::ValidationFailed(
                "PAYMENT_POLL_MAX_BACKOFF_SECONDS must be >= PAYMENT_POLL_INTERVAL_SECONDS"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_port_and_host_are_required() {
        let mut config = ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
        };
        assert!(config.validate().is_ok());

        config.port = 0;
        assert!(config.validate().is_err());

        config.port = 8080;
        config.host = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payments_defaults() {
        let config = PaymentsConfig::default();
        assert_eq!(config.verification_window, Duration::from_secs(180));
        assert_eq!(config.subscription_period_days, 30);
        assert_eq!(config.daily_unlock_credits, 10);
        assert_eq!(config.daily_unlock_validity, Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_must_cover_interval() {
        let config = PaymentsConfig {
            poll_interval: Duration::from_secs(10),
            poll_max_backoff: Duration::from_secs(5),
            ..PaymentsConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_database_url_scheme() {
        let config = DatabaseConfig {
            url: "mysql://localhost/db".to_string(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout: 30,
            idle_timeout: 600,
        };
        assert!(config.validate().is_err());

        let config = DatabaseConfig {
            url: "postgres://localhost/swipepay".to_string(),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            format: LogFormat::Plain,
        };
        assert!(config.validate().is_err());
    }
}
