//! Cancellable background polling of a single payment.
//!
//! The client UI used to own this loop through a timer; here it is an explicit
//! task with a handle. The loop stops when the payment is terminal, when the
//! verification window has run out, or when the handle is cancelled.

use crate::config::PaymentsConfig;
use crate::payments::types::PaymentStatus;
use crate::services::status_refresh::{RefreshError, RefreshOutcome, StatusRefreshService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a poll loop ended.
#[derive(Debug)]
pub enum PollExit {
    Settled(PaymentStatus),
    /// Window elapsed while the provider was unreachable; the sweeper takes
    /// it from here.
    Expired,
    Cancelled,
    Failed(RefreshError),
}

pub struct PollHandle {
    payment_id: Uuid,
    latest_rx: watch::Receiver<Option<RefreshOutcome>>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<PollExit>,
}

impl PollHandle {
    pub fn payment_id(&self) -> Uuid {
        self.payment_id
    }

    /// Most recent refresh result, if any cycle has completed.
    pub fn latest(&self) -> Option<RefreshOutcome> {
        self.latest_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<RefreshOutcome>> {
        self.latest_rx.clone()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub async fn wait(self) -> PollExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(payment_id = %self.payment_id, error = %e, "poll task aborted");
                PollExit::Cancelled
            }
        }
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    refresh: Arc<StatusRefreshService>,
    interval: Duration,
    max_backoff: Duration,
}

impl StatusPoller {
    pub fn new(refresh: Arc<StatusRefreshService>, config: &PaymentsConfig) -> Self {
        Self::with_intervals(refresh, config.poll_interval, config.poll_max_backoff)
    }

    pub fn with_intervals(
        refresh: Arc<StatusRefreshService>,
        interval: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            refresh,
            interval,
            max_backoff: max_backoff.max(interval),
        }
    }

    pub fn spawn(&self, payment_id: Uuid, user_id: Uuid) -> PollHandle {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let poller = self.clone();

        let task = tokio::spawn(async move {
            poller
                .run(payment_id, user_id, latest_tx, cancel_rx)
                .await
        });

        PollHandle {
            payment_id,
            latest_rx,
            cancel_tx,
            task,
        }
    }

    async fn run(
        self,
        payment_id: Uuid,
        user_id: Uuid,
        latest_tx: watch::Sender<Option<RefreshOutcome>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> PollExit {
        let mut consecutive_errors: u32 = 0;

        loop {
            if *cancel_rx.borrow() {
                return PollExit::Cancelled;
            }

            let outcome = match self.refresh.refresh(payment_id, user_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(payment_id = %payment_id, error = %e, "status polling stopped");
                    return PollExit::Failed(e);
                }
            };
            let _ = latest_tx.send(Some(outcome.clone()));

            if outcome.is_terminal() {
                info!(payment_id = %payment_id, status = %outcome.status, "payment settled");
                return PollExit::Settled(outcome.status);
            }
            if outcome.expires_in_ms == Some(0) {
                info!(payment_id = %payment_id, "verification window elapsed while polling");
                return PollExit::Expired;
            }

            consecutive_errors = if outcome.is_provider_error() {
                consecutive_errors.saturating_add(1)
            } else {
                0
            };
            let delay = backoff_delay(self.interval, self.max_backoff, consecutive_errors);
            debug!(payment_id = %payment_id, delay_ms = delay.as_millis() as u64, "next status poll scheduled");

            tokio::select! {
                changed = cancel_rx.changed() => {
                    // A dropped handle counts as cancellation.
                    if changed.is_err() || *cancel_rx.borrow() {
                        return PollExit::Cancelled;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// `interval * 2^errors`, capped at `max`.
pub fn backoff_delay(interval: Duration, max: Duration, consecutive_errors: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_errors.min(16));
    interval.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_on_provider_errors_and_caps() {
        let interval = Duration::from_secs(3);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(interval, max, 0), Duration::from_secs(3));
        assert_eq!(backoff_delay(interval, max, 1), Duration::from_secs(6));
        assert_eq!(backoff_delay(interval, max, 2), Duration::from_secs(12));
        assert_eq!(backoff_delay(interval, max, 3), Duration::from_secs(24));
        assert_eq!(backoff_delay(interval, max, 4), Duration::from_secs(30));
        assert_eq!(backoff_delay(interval, max, 99), Duration::from_secs(30));
    }
}
