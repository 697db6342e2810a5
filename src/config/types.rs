//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Address and port to accept clients on
    pub listen: SocketAddr,

    /// How long an outbound connect may take before it counts as a failure
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Consecutive connect failures tolerated before a target is disabled
    #[serde(default = "default_failure_count_limit")]
    pub failure_count_limit: u32,

    /// Terminate live connections when their target is disabled
    #[serde(default)]
    pub terminate_on_disable: bool,

    /// Propagate end-of-stream one direction at a time instead of closing
    #[serde(default)]
    pub half_close: bool,

    /// Ordered chain of distribution algorithms
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<AlgorithmConfig>,

    /// Ordered target groups (failover order)
    #[serde(default)]
    pub target_groups: Vec<TargetGroupConfig>,

    /// Health check settings, applied to every target
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    /// Administrative console
    #[serde(default)]
    pub control: Option<ControlConfig>,
}

impl Config {
    /// Settings every target is created with.
    pub fn target_settings(&self) -> TargetSettings {
        TargetSettings {
            failure_count_limit: self.failure_count_limit,
            terminate_on_disable: self.terminate_on_disable,
            half_close: self.half_close,
        }
    }

    /// Total number of configured targets across all groups.
    pub fn target_count(&self) -> usize {
        self.target_groups.iter().map(|g| g.targets.len()).sum()
    }
}

/// Per-target behaviour shared by every target in the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSettings {
    pub failure_count_limit: u32,
    pub terminate_on_disable: bool,
    pub half_close: bool,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            failure_count_limit: default_failure_count_limit(),
            terminate_on_disable: false,
            half_close: false,
        }
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Distribution algorithm, tagged by `type` in the configuration file.
///
/// This enum is the registry of available algorithms: adding a variant here
/// and a constructor arm in `backend::algorithms::build_algorithm` is all
/// that is needed to make a new algorithm configurable.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Cycle through every target of every group until one accepts.
    RoundRobin,
    /// Send repeat clients back to the target they used last.
    StickyHash {
        /// How long an idle address→target mapping is remembered
        #[serde(default = "default_sticky_timeout", with = "humantime_serde")]
        sticky_timeout: Duration,
    },
}

impl AlgorithmConfig {
    /// Name used in logs and the administrative console.
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::RoundRobin => "round_robin",
            AlgorithmConfig::StickyHash { .. } => "sticky_hash",
        }
    }
}

/// One failover group of targets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetGroupConfig {
    /// Target addresses, in initial rotation order
    pub targets: Vec<SocketAddr>,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Type of health check: tcp, http or script
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,

    /// How often every target is probed
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long a single probe may take
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// HTTP path to check (for HTTP health checks)
    #[serde(default)]
    pub path: Option<String>,

    /// Expected HTTP status code (for HTTP health checks)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Command to run (for script health checks), invoked as `command <ip> <port>`
    #[serde(default)]
    pub command: Option<PathBuf>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_type: HealthCheckType::Tcp,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            path: None,
            expected_status: default_expected_status(),
            command: None,
        }
    }
}

/// Type of health check.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    #[default]
    Tcp,
    Http,
    Script,
}

/// Administrative console configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Whether the console is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the console on
    #[serde(default = "default_control_address")]
    pub address: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_control_address(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_control_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2090))
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_failure_count_limit() -> u32 {
    5
}

fn default_algorithms() -> Vec<AlgorithmConfig> {
    vec![AlgorithmConfig::RoundRobin]
}

fn default_sticky_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_expected_status() -> u16 {
    200
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
