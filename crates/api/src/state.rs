//! Application state

use std::sync::Arc;

use kanjipress_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Billing engine; None when billing is disabled or unconfigured.
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            pool,
            config,
            billing,
        }
    }

    /// State with an explicit billing service (tests).
    pub fn with_billing(pool: PgPool, config: Config, billing: Arc<BillingService>) -> Self {
        Self {
            pool,
            config,
            billing: Some(billing),
        }
    }
}
