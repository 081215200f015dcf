//! API server configuration

use anyhow::Context;

/// Server configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Billing is optional so the server can run in content-only deployments
    /// (local development without Stripe credentials).
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a number")?;

        let enable_billing = std::env::var("ENABLE_BILLING")
            .map(|v| v != "false")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            host,
            port,
            enable_billing,
        })
    }
}
