//! Server Configuration

use std::time::Duration;

/// HTTP server settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// SQLite file path, or `:memory:`
    pub database_path: String,

    /// Static token for admin routes; admin routes are disabled when unset
    pub admin_token: Option<String>,

    /// How often the background task compares cached and computed balances
    pub reconcile_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            database_path: "ledger.db".into(),
            admin_token: None,
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_path: std::env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            reconcile_interval: std::env::var("RECONCILE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|secs| *secs > 0)
                .map_or(defaults.reconcile_interval, Duration::from_secs),
        }
    }
}
