//! Payment provider integration: aggregator client, response normalization
//! and the shared payment types.

pub mod error;
pub mod normalize;
pub mod provider;
pub mod providers;
pub mod types;
pub mod utils;
