use std::time::Duration;

use anyhow::Result;

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    /// A node whose last health check is older than this is marked offline.
    pub node_stale_after: Duration,
    /// Unbound reservations older than this are released.
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("WARDEN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("WARDEN_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        let node_stale_after = secs_from_env("WARDEN_NODE_STALE_SECS", 90)?;
        let reservation_ttl = secs_from_env("WARDEN_RESERVATION_TTL_SECS", 300)?;
        let sweep_interval = secs_from_env("WARDEN_SWEEP_INTERVAL_SECS", 30)?;

        Ok(Self {
            log_level,
            dev_mode,
            database,
            node_stale_after,
            reservation_ttl,
            sweep_interval,
        })
    }
}

fn secs_from_env(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("{name} must be a whole number of seconds: {e}"))?;
            if secs == 0 {
                anyhow::bail!("{name} must be positive");
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
