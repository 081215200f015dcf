// API crate clippy configuration
#![allow(clippy::single_match)] // Clearer in some cases
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Kanjipress API Library
//!
//! HTTP surface for the entitlement engine: the billing webhook endpoint
//! and the admin webhook inspection/replay routes.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
