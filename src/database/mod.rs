//! Payment persistence: the [`repository::PaymentStore`] seam, a Postgres
//! implementation behind the `database` feature and an in-memory one.

pub mod error;
pub mod memory_store;
pub mod repository;

#[cfg(feature = "database")]
pub mod entitlement_repository;
#[cfg(feature = "database")]
pub mod payment_repository;

#[cfg(feature = "database")]
pub use pool::{health_check, init_pool, init_pool_from_config, PoolConfig};

#[cfg(feature = "database")]
mod pool {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{info, warn};

    use super::error::DatabaseError;
    use crate::config::DatabaseConfig;

    /// Sizing and timeouts for the Postgres pool.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub acquire_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                max_connections: 10,
                min_connections: 1,
                acquire_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(1800),
            }
        }
    }

    impl From<&DatabaseConfig> for PoolConfig {
        fn from(config: &DatabaseConfig) -> Self {
            Self {
                max_connections: config.max_connections,
                min_connections: config.min_connections,
                acquire_timeout: Duration::from_secs(config.connection_timeout),
                idle_timeout: Duration::from_secs(config.idle_timeout),
                ..Self::default()
            }
        }
    }

    pub async fn init_pool(database_url: &str, config: PoolConfig) -> Result<PgPool, DatabaseError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_secs = config.acquire_timeout.as_secs(),
            "opening postgres pool"
        );

        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                warn!(error = %e, "postgres pool could not connect");
                DatabaseError::from_sqlx(e)
            })
    }

    pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        init_pool(&config.url, PoolConfig::from(config)).await
    }

    pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(DatabaseError::from_sqlx)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pool_config_follows_database_config() {
            let config = DatabaseConfig {
                url: "postgres://localhost/swipepay".to_string(),
                max_connections: 25,
                min_connections: 3,
                connection_timeout: 5,
                idle_timeout: 120,
            };

            let pool = PoolConfig::from(&config);
            assert_eq!(pool.max_connections, 25);
            assert_eq!(pool.min_connections, 3);
            assert_eq!(pool.acquire_timeout, Duration::from_secs(5));
            assert_eq!(pool.idle_timeout, Duration::from_secs(120));
            assert_eq!(pool.max_lifetime, PoolConfig::default().max_lifetime);
        }
    }
}
