//! Configuration file loading.

use crate::config::{validate_config, Config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML file.
///
/// This function reads the file, parses the YAML, and validates the configuration.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(contents)?;

    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlgorithmConfig, HealthCheckType};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
listen: "127.0.0.1:8080"
target_groups:
  - targets: ["127.0.0.1:9000", "127.0.0.1:9001"]
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.target_groups.len(), 1);
        assert_eq!(config.target_groups[0].targets.len(), 2);
    }

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
global:
  log_level: debug
  log_format: json
listen: "0.0.0.0:8080"
connect_timeout: 500ms
failure_count_limit: 2
terminate_on_disable: true
half_close: true
algorithms:
  - type: sticky_hash
    sticky_timeout: 10m
  - type: round_robin
target_groups:
  - targets: ["10.0.0.1:80", "10.0.0.2:80"]
  - targets: ["10.0.1.1:80"]
health_check:
  type: http
  interval: 15s
  timeout: 1s
  path: /healthz
control:
  address: "127.0.0.1:2099"
"#;

        let config = parse_config(yaml).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.failure_count_limit, 2);
        assert!(config.terminate_on_disable);
        assert!(config.half_close);
        assert_eq!(config.algorithms.len(), 2);
        assert_eq!(config.algorithms[1], AlgorithmConfig::RoundRobin);
        assert_eq!(config.target_count(), 3);

        let hc = config.health_check.unwrap();
        assert_eq!(hc.check_type, HealthCheckType::Http);
        assert_eq!(hc.interval, Duration::from_secs(15));
        assert_eq!(hc.path.as_deref(), Some("/healthz"));

        let control = config.control.unwrap();
        assert!(control.enabled);
        assert_eq!(control.address, "127.0.0.1:2099".parse().unwrap());
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not: valid: yaml: {{{}}}").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_fails_validation() {
        let result = parse_config("listen: \"127.0.0.1:8080\"\n");
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }
}
