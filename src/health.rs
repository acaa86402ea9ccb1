//! `/health` report: one probe per dependency, each bounded by a timeout.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::database::repository::PaymentStore;

const PAYMENT_STORE: &str = "payment_store";

#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
}

impl HealthStatus {
    /// Healthy only when every component is up.
    fn from_checks(checks: HashMap<String, ComponentHealth>) -> Self {
        let status = if checks.values().all(|c| c.status == ComponentState::Up) {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        Self {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn PaymentStore>,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self {
            store,
            check_timeout: Duration::from_secs(5),
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert(PAYMENT_STORE.to_string(), self.probe_store().await);
        HealthStatus::from_checks(checks)
    }

    async fn probe_store(&self) -> ComponentHealth {
        let started = Instant::now();
        match timeout(self.check_timeout, self.store.health_check()).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed().as_millis();
                debug!(elapsed_ms = elapsed as u64, "payment store reachable");
                ComponentHealth {
                    status: ComponentState::Up,
                    response_time_ms: Some(elapsed),
                    details: None,
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "payment store health check failed");
                down(e.to_string())
            }
            Err(_) => {
                error!(
                    timeout_secs = self.check_timeout.as_secs(),
                    "payment store health check timed out"
                );
                down("timeout".to_string())
            }
        }
    }
}

fn down(details: String) -> ComponentHealth {
    ComponentHealth {
        status: ComponentState::Down,
        response_time_ms: None,
        details: Some(details),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_store::MemoryPaymentStore;

    #[tokio::test]
    async fn memory_store_reports_healthy() {
        let checker = HealthChecker::new(Arc::new(MemoryPaymentStore::new()));
        let status = checker.check_health().await;

        assert!(status.is_healthy());
        assert_eq!(status.checks[PAYMENT_STORE].status, ComponentState::Up);
    }

    #[test]
    fn one_failed_component_makes_the_service_unhealthy() {
        let mut checks = HashMap::new();
        checks.insert(PAYMENT_STORE.to_string(), down("connection refused".into()));
        assert_eq!(
            HealthStatus::from_checks(checks).status,
            HealthState::Unhealthy
        );
    }
}
