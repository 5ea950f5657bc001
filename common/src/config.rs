// Configuration management with layered configuration (file, env, CLI)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for everything this process needs to talk to the daemon and
/// the ledger, plus the job context it was launched under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub daemon: DaemonConfig,
    pub urd: UrdConfig,
    pub job: JobContextConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub url: String,
    /// Legacy workspace name, passed through to `Automation` for display.
    pub dataset: String,
    pub request_timeout_seconds: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrdConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub horizon: Option<String>,
}

/// Mirrors the process globals the host injects into a running job:
/// `JOBID`, `SLICES`, and the current phase (`running`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContextConfig {
    pub jobid: String,
    pub slices: usize,
    pub phase: String,
    /// Workspace storage root every job directory lives under.
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults -> file -> env.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.daemon.url.is_empty() {
            return Err("daemon.url cannot be empty".to_string());
        }
        if self.daemon.request_timeout_seconds == 0 {
            return Err("daemon.request_timeout_seconds must be greater than 0".to_string());
        }
        if self.urd.url.is_empty() {
            return Err("urd.url cannot be empty".to_string());
        }
        if self.urd.user.is_empty() {
            return Err("urd.user cannot be empty".to_string());
        }
        if self.job.jobid.is_empty() {
            return Err("job.jobid cannot be empty".to_string());
        }
        if self.job.slices == 0 {
            return Err("job.slices must be greater than 0".to_string());
        }
        if self.job.root.is_empty() {
            return Err("job.root cannot be empty".to_string());
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig {
                url: "http://localhost:8003".to_string(),
                dataset: "churn".to_string(),
                request_timeout_seconds: 30,
                circuit_breaker_failure_threshold: 5,
                circuit_breaker_timeout_seconds: 60,
            },
            urd: UrdConfig {
                url: "http://localhost:8001".to_string(),
                user: "anonymous".to_string(),
                password: String::new(),
                horizon: None,
            },
            job: JobContextConfig {
                jobid: "PROJ-0".to_string(),
                slices: 8,
                phase: "synthesis".to_string(),
                root: "./workspace".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json: false,
                metrics_port: None,
            },
        }
    }
}
