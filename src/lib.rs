//! Payment reconciliation backend for in-app purchases settled over M-Pesa.
//!
//! A payment starts `pending` and is moved to `completed` or `failed` exactly
//! once, by whichever of the status refresh, the provider webhook or the
//! background sweeper learns the outcome first.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
