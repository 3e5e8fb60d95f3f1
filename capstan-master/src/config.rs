//! Master configuration
//!
//! All intervals are configurable to allow tuning for different deployment
//! scenarios (dev vs prod, fast vs slow networks).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address workers connect to (e.g. "0.0.0.0:7700")
    pub bind_addr: String,

    /// How often the scheduler scans pending runs
    pub scheduler_interval: Duration,

    /// How often each worker proxy pings and advances its executors
    pub proxy_tick: Duration,

    /// How often the supervisor scans records for disconnect flags
    pub supervisor_tick: Duration,

    /// Bound on graceful shutdown before the process exits anyway
    pub shutdown_timeout: Duration,
}

impl MasterConfig {
    pub fn new(bind_addr: String) -> Self {
        Self {
            bind_addr,
            scheduler_interval: Duration::from_secs(5),
            proxy_tick: Duration::from_secs(1),
            supervisor_tick: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - MASTER_BIND_ADDR (optional, default: 0.0.0.0:7700)
    /// - SCHEDULER_INTERVAL (optional, seconds, default: 5)
    /// - PROXY_TICK (optional, seconds, default: 1)
    /// - SUPERVISOR_TICK (optional, seconds, default: 10)
    /// - SHUTDOWN_TIMEOUT (optional, seconds, default: 30)
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("MASTER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7700".to_string());

        let mut config = Self::new(bind_addr);
        config.scheduler_interval = env_seconds("SCHEDULER_INTERVAL", 5);
        config.proxy_tick = env_seconds("PROXY_TICK", 1);
        config.supervisor_tick = env_seconds("SUPERVISOR_TICK", 10);
        config.shutdown_timeout = env_seconds("SHUTDOWN_TIMEOUT", 30);
        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }
        if self.scheduler_interval.is_zero() {
            anyhow::bail!("scheduler_interval must be greater than 0");
        }
        if self.proxy_tick.is_zero() {
            anyhow::bail!("proxy_tick must be greater than 0");
        }
        Ok(())
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::new("0.0.0.0:7700".to_string())
    }
}

fn env_seconds(name: &str, default: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.scheduler_interval, Duration::from_secs(5));
        assert_eq!(config.proxy_tick, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = MasterConfig::default();
        assert!(config.validate().is_ok());

        config.bind_addr = String::new();
        assert!(config.validate().is_err());

        config.bind_addr = "127.0.0.1:7700".to_string();
        config.scheduler_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
