#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kanjipress shared types and database helpers
//!
//! Small pieces used by both the API server and the billing engine:
//! plan tiers and connection-pool construction with embedded migrations.

pub mod db;
pub mod tier;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use tier::PlanTier;
