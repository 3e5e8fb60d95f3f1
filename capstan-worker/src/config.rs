//! Worker configuration
//!
//! All timeouts and intervals are configurable to allow tuning for different
//! deployment scenarios.

use std::path::PathBuf;
use std::time::Duration;

use capstan_core::domain::WorkerProperties;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique identifier this worker registers as
    pub worker_id: String,

    /// Master address (host:port)
    pub master_addr: String,

    /// Credential presented during the handshake
    pub token: String,

    pub display_name: String,

    pub version: String,

    /// Capability tags advertised to the master
    pub properties: WorkerProperties,

    /// Where per-run state (request/status/results/logs) lives
    pub state_dir: PathBuf,

    /// Where run workspaces are created
    pub workspace_dir: PathBuf,

    /// How often executors push buffered status/log deltas
    pub sync_interval: Duration,

    /// How often the pipeline executor polls inner runs
    pub pipeline_poll_interval: Duration,

    /// Graceful-termination wait before a subprocess is force-killed
    pub terminate_timeout: Duration,

    /// Bound on process shutdown before exiting with executors still up
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: String, master_addr: String) -> Self {
        Self {
            display_name: worker_id.clone(),
            worker_id,
            master_addr,
            token: "capstan".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            properties: WorkerProperties::default(),
            state_dir: PathBuf::from("state"),
            workspace_dir: PathBuf::from("workspace"),
            sync_interval: Duration::from_secs(1),
            pipeline_poll_interval: Duration::from_secs(5),
            terminate_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (required)
    /// - MASTER_ADDR (required)
    /// - WORKER_TOKEN (optional, default: "capstan")
    /// - WORKER_PROJECTS (optional, comma-separated)
    /// - WORKER_IS_CONTROLLER (optional, "true"/"false")
    /// - WORKER_EXECUTOR_LIMIT (optional, default: 2)
    /// - WORKER_STATE_DIR / WORKER_WORKSPACE_DIR (optional)
    /// - SYNC_INTERVAL / PIPELINE_POLL_INTERVAL / TERMINATE_TIMEOUT /
    ///   SHUTDOWN_TIMEOUT (optional, seconds)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .map_err(|_| anyhow::anyhow!("WORKER_ID environment variable not set"))?;
        let master_addr = std::env::var("MASTER_ADDR")
            .map_err(|_| anyhow::anyhow!("MASTER_ADDR environment variable not set"))?;

        let mut config = Self::new(worker_id, master_addr);

        if let Ok(token) = std::env::var("WORKER_TOKEN") {
            config.token = token;
        }
        if let Ok(projects) = std::env::var("WORKER_PROJECTS") {
            config.properties.projects = projects
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Ok(flag) = std::env::var("WORKER_IS_CONTROLLER") {
            config.properties.is_controller = flag == "true";
        }
        if let Some(limit) = env_parse::<usize>("WORKER_EXECUTOR_LIMIT") {
            config.properties.executor_limit = limit;
        }
        if let Ok(dir) = std::env::var("WORKER_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("WORKER_WORKSPACE_DIR") {
            config.workspace_dir = PathBuf::from(dir);
        }
        if let Some(seconds) = env_parse::<u64>("SYNC_INTERVAL") {
            config.sync_interval = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("PIPELINE_POLL_INTERVAL") {
            config.pipeline_poll_interval = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("TERMINATE_TIMEOUT") {
            config.terminate_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SHUTDOWN_TIMEOUT") {
            config.shutdown_timeout = Duration::from_secs(seconds);
        }

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }
        if self.master_addr.is_empty() {
            anyhow::bail!("master_addr cannot be empty");
        }
        if self.properties.executor_limit == 0 {
            anyhow::bail!("executor_limit must be greater than 0");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = WorkerConfig::new("worker-1".into(), "127.0.0.1:7700".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.display_name, "worker-1");
        assert_eq!(config.sync_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validation_rejects_empty_fields() {
        let mut config = WorkerConfig::new("worker-1".into(), "127.0.0.1:7700".into());
        config.worker_id = String::new();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::new("worker-1".into(), "127.0.0.1:7700".into());
        config.properties.executor_limit = 0;
        assert!(config.validate().is_err());
    }
}
