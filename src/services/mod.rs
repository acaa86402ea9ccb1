//! Services module for payment reconciliation logic

pub mod finalization;
pub mod status_poller;
pub mod status_refresh;
pub mod webhook_processor;

#[cfg(test)]
mod webhook_processor_tests;

pub use finalization::{
    FailureReason, Finalization, FinalizationEngine, FinalizationSource, FinalizeError, Outcome,
};
pub use status_poller::{PollExit, PollHandle, StatusPoller};
pub use status_refresh::{RefreshError, RefreshOutcome, StatusRefreshService};
pub use webhook_processor::{WebhookOutcome, WebhookProcessor, WebhookProcessorError};
