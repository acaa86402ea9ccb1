use crate::database::error::DatabaseError;
use crate::database::repository::PaymentStore;
use crate::payments::normalize::ProviderStatus;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{Payment, PaymentStatus};
use crate::services::finalization::{
    FailureReason, Finalization, FinalizationEngine, FinalizationSource, FinalizeError, Outcome,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

/// Errors that abort a whole sweep cycle. Per-payment failures are logged and
/// counted instead.
#[derive(Debug, thiserror::Error)]
pub enum SweeperError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaymentSweeperConfig {
    pub enabled: bool,
    /// How often the worker wakes up.
    pub interval: Duration,
    /// Pending payments older than this are past their deadline.
    pub verification_window: Duration,
    /// Failed payments are purged this long after finalization.
    pub failed_retention: Duration,
    /// Overdue payments the provider cannot answer for are given up after this
    /// age.
    pub abandon_after: Duration,
    pub batch_size: i64,
    /// Provider lookups in flight per cycle.
    pub concurrency: usize,
}

impl Default for PaymentSweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            verification_window: Duration::from_secs(180),
            failed_retention: Duration::from_secs(600),
            abandon_after: Duration::from_secs(1800),
            batch_size: 100,
            concurrency: 8,
        }
    }
}

impl PaymentSweeperConfig {
    pub fn from_env(verification_window: Duration) -> Self {
        let mut cfg = Self {
            verification_window,
            ..Self::default()
        };
        cfg.enabled = std::env::var("PAYMENT_SWEEPER_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(cfg.enabled);
        cfg.interval = Duration::from_secs(
            std::env::var("PAYMENT_SWEEPER_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.interval.as_secs()),
        );
        cfg.failed_retention = Duration::from_secs(
            std::env::var("PAYMENT_FAILED_RETENTION_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.failed_retention.as_secs()),
        );
        cfg.abandon_after = Duration::from_secs(
            std::env::var("PAYMENT_ABANDON_AFTER_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.abandon_after.as_secs()),
        );
        cfg.batch_size = std::env::var("PAYMENT_SWEEPER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg
    }
}

/// Counters for one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    /// Provider unreachable, retried next cycle.
    pub deferred: usize,
    /// Settled by another path while the sweep was running.
    pub already_settled: usize,
    pub errors: usize,
    pub purged: u64,
}

enum Disposition {
    Finalized(Finalization),
    Deferred,
    Error,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct PaymentSweeperWorker {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn PaymentProvider>,
    engine: Arc<FinalizationEngine>,
    config: PaymentSweeperConfig,
}

impl PaymentSweeperWorker {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        provider: Arc<dyn PaymentProvider>,
        engine: Arc<FinalizationEngine>,
        config: PaymentSweeperConfig,
    ) -> Self {
        Self {
            store,
            provider,
            engine,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            verification_window_secs = self.config.verification_window.as_secs(),
            failed_retention_secs = self.config.failed_retention.as_secs(),
            abandon_after_secs = self.config.abandon_after.as_secs(),
            batch_size = self.config.batch_size,
            "payment sweeper worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment sweeper worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(?report, "payment sweep cycle finished");
                        }
                        Ok(_) => debug!("payment sweep cycle found nothing to do"),
                        Err(e) => warn!(error = %e, "payment sweep cycle failed"),
                    }
                }
            }
        }

        info!("payment sweeper worker stopped");
    }

    pub async fn run_cycle(&self) -> Result<SweepReport, SweeperError> {
        let now = Utc::now();
        let mut report = self.expire_overdue(now).await?;
        report.purged = self.purge_failed(now).await?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Overdue pending payments
    // -----------------------------------------------------------------------

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepReport, SweeperError> {
        let cutoff = now - to_chrono(self.config.verification_window)?;
        let overdue = self
            .store
            .list_pending_created_before(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: overdue.len(),
            ..SweepReport::default()
        };
        if overdue.is_empty() {
            return Ok(report);
        }

        let dispositions: Vec<Disposition> = stream::iter(overdue)
            .map(|payment| self.settle_overdue(payment, now))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for disposition in dispositions {
            match disposition {
                Disposition::Finalized(Finalization::Applied(payment)) => {
                    if payment.status == PaymentStatus::Completed {
                        report.completed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Disposition::Finalized(Finalization::AlreadySettled(_)) => {
                    report.already_settled += 1
                }
                Disposition::Deferred => report.deferred += 1,
                Disposition::Error => report.errors += 1,
            }
        }

        Ok(report)
    }

    async fn settle_overdue(&self, payment: Payment, now: DateTime<Utc>) -> Disposition {
        let (outcome, observed) = match self.final_outcome(&payment, now).await {
            Some(decision) => decision,
            None => return Disposition::Deferred,
        };

        let result = match observed {
            Some(status) => {
                self.engine
                    .finalize_observed(payment.id, outcome, FinalizationSource::Sweeper, status)
                    .await
            }
            None => {
                self.engine
                    .finalize(payment.id, outcome, FinalizationSource::Sweeper)
                    .await
            }
        };

        match result {
            Ok(finalization) => Disposition::Finalized(finalization),
            // Cannot ever be granted; fail it so it stops occupying the batch.
            Err(FinalizeError::MissingUnlockTarget(_)) => {
                warn!(payment_id = %payment.id, "overdue unlock has no target, abandoning payment");
                self.abandon(&payment).await
            }
            Err(e) => {
                error!(payment_id = %payment.id, error = %e, "sweeper could not finalize payment");
                Disposition::Error
            }
        }
    }

    async fn abandon(&self, payment: &Payment) -> Disposition {
        let outcome = Outcome::Failure {
            reason: FailureReason::Abandoned,
        };
        match self
            .engine
            .finalize(payment.id, outcome, FinalizationSource::Sweeper)
            .await
        {
            Ok(finalization) => Disposition::Finalized(finalization),
            Err(e) => {
                error!(payment_id = %payment.id, error = %e, "sweeper could not abandon payment");
                Disposition::Error
            }
        }
    }

    /// Last provider check before giving up on an overdue payment, with the
    /// provider status that decided it. `None` leaves it for the next cycle.
    async fn final_outcome(
        &self,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> Option<(Outcome, Option<ProviderStatus>)> {
        let abandoned = Outcome::Failure {
            reason: FailureReason::Abandoned,
        };
        let reference = match payment.provider_reference() {
            Some(reference) => reference,
            None => {
                warn!(payment_id = %payment.id, "overdue payment has no provider reference");
                return Some((abandoned, None));
            }
        };

        match self.provider.lookup_transaction(&reference).await {
            Ok(lookup) if lookup.status == ProviderStatus::Success => {
                Some((Outcome::Success, Some(lookup.status)))
            }
            Ok(lookup) => {
                debug!(
                    payment_id = %payment.id,
                    provider_status = %lookup.status,
                    "overdue payment not confirmed by provider"
                );
                Some((
                    Outcome::Failure {
                        reason: FailureReason::VerificationTimeout,
                    },
                    Some(lookup.status),
                ))
            }
            Err(e) if self.is_abandoned(payment, now) => {
                warn!(
                    payment_id = %payment.id,
                    error = %e,
                    "provider still unreachable, abandoning payment"
                );
                Some((abandoned, None))
            }
            Err(e) => {
                warn!(
                    payment_id = %payment.id,
                    error = %e,
                    "provider lookup failed, retrying next cycle"
                );
                None
            }
        }
    }

    fn is_abandoned(&self, payment: &Payment, now: DateTime<Utc>) -> bool {
        (now - payment.created_at)
            .to_std()
            .map(|age| age >= self.config.abandon_after)
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    async fn purge_failed(&self, now: DateTime<Utc>) -> Result<u64, SweeperError> {
        let cutoff = now - to_chrono(self.config.failed_retention)?;
        let purged = self.store.delete_failed_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "purged expired failed payments");
        }
        Ok(purged)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, SweeperError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| SweeperError::Internal(format!("duration out of range: {}", e)))
}
