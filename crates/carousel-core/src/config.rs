//! carousel.toml configuration parser.
//!
//! Loaded once at startup; changes require a restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub rotation: RotationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Lower bound of the jittered rotation interval.
    #[serde(with = "serde_str")]
    pub interval_min: Duration,
    /// Upper bound of the jittered rotation interval.
    #[serde(with = "serde_str")]
    pub interval_max: Duration,
    /// Floor on Active ∧ Healthy instances.
    pub min_healthy: u32,
    /// Desired size of the Active set.
    #[serde(default = "default_active_count")]
    pub active_count: u32,
    /// Candidate start/health failures before quarantine.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
    /// Background retries for a retiring container that refuses to stop.
    #[serde(default = "default_stop_retry_attempts")]
    pub stop_retry_attempts: u32,
    /// Fixed RNG seed; entropy-seeded when absent.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "serde_str")]
    pub start: Duration,
    #[serde(with = "serde_str")]
    pub stop: Duration,
    /// Deadline for a started candidate to report Healthy.
    #[serde(with = "serde_str")]
    pub verify: Duration,
    /// Deadline for validate + apply of a proxy configuration.
    #[serde(with = "serde_str")]
    pub proxy: Duration,
    /// Cap on the backoff between runtime pings while paused.
    #[serde(with = "serde_str")]
    pub runtime_backoff_max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(30),
            stop: Duration::from_secs(15),
            verify: Duration::from_secs(60),
            proxy: Duration::from_secs(10),
            runtime_backoff_max: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// HTTP path to probe (e.g. "/healthz").
    pub path: String,
    /// Port appended to the instance name when no address is configured.
    pub port: u16,
    /// Timeout per probe.
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    /// Background monitor tick.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Consecutive failures before marking unhealthy.
    pub failure_threshold: u32,
    #[serde(with = "serde_str")]
    pub max_backoff: Duration,
    /// Probe cadence while verifying a candidate.
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
    /// How long an Unhealthy Standby stays ineligible.
    #[serde(with = "serde_str")]
    pub standby_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            port: 8080,
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            max_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            standby_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `unix:///var/run/docker.sock` or `tcp://docker-proxy:2375`.
    pub endpoint: String,
    /// Docker Engine API version prefix, e.g. "v1.43". Unversioned when empty.
    pub api_version: String,
    /// Per-request timeout against the runtime API.
    #[serde(with = "serde_str")]
    pub request_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            api_version: String::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Live configuration file the proxy includes.
    pub config_path: PathBuf,
    /// Upstream block name.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Lint command; `{path}` is replaced with the staged file.
    #[serde(default)]
    pub validate_command: Vec<String>,
    /// Reload command, run after the live file has been swapped.
    #[serde(default)]
    pub reload_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub retention_count: usize,
    #[serde(with = "serde_str")]
    pub retention_window: Duration,
    #[serde(with = "serde_str")]
    pub cache_ttl: Duration,
    /// redb file for rotation history; in-memory only when absent.
    pub db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            retention_count: 1000,
            retention_window: Duration::from_secs(7 * 86_400),
            cache_ttl: Duration::from_secs(10),
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Container name, also the logical instance name.
    pub name: String,
    /// Probe address; defaults to `{name}:{health.port}`.
    pub address: Option<String>,
}

fn default_active_count() -> u32 {
    1
}

fn default_quarantine_threshold() -> u32 {
    3
}

fn default_stop_retry_attempts() -> u32 {
    5
}

fn default_upstream() -> String {
    "carousel_backend".to_string()
}

impl OrchestratorConfig {
    /// Read, parse and validate a configuration file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: OrchestratorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        let r = &self.rotation;
        if r.min_healthy == 0 {
            return Err(invalid("rotation.min_healthy must be at least 1"));
        }
        if r.active_count < r.min_healthy {
            return Err(invalid(format!(
                "rotation.active_count ({}) is below rotation.min_healthy ({})",
                r.active_count, r.min_healthy
            )));
        }
        if r.interval_min > r.interval_max {
            return Err(invalid("rotation.interval_min exceeds rotation.interval_max"));
        }
        if r.interval_max.is_zero() {
            return Err(invalid("rotation.interval_max must be positive"));
        }
        if r.quarantine_threshold == 0 {
            return Err(invalid("rotation.quarantine_threshold must be at least 1"));
        }
        if self.health.failure_threshold == 0 {
            return Err(invalid("health.failure_threshold must be at least 1"));
        }
        if self.instances.len() <= r.active_count as usize {
            return Err(invalid(format!(
                "need more than {} instances to rotate, found {}",
                r.active_count,
                self.instances.len()
            )));
        }

        let mut seen = HashSet::new();
        for inst in &self.instances {
            if inst.name.trim().is_empty() {
                return Err(invalid("instance name must not be empty"));
            }
            if !seen.insert(inst.name.as_str()) {
                return Err(invalid(format!("duplicate instance name {:?}", inst.name)));
            }
        }

        if self.telemetry.retention_count == 0 {
            return Err(invalid("telemetry.retention_count must be at least 1"));
        }
        if self.proxy.upstream.trim().is_empty() {
            return Err(invalid("proxy.upstream must not be empty"));
        }
        Ok(())
    }

    /// Probe address for an instance.
    pub fn instance_address(&self, inst: &InstanceConfig) -> String {
        inst.address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", inst.name, self.health.port))
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
