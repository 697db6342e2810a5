//! Configuration validation.

use crate::config::{AlgorithmConfig, Config, HealthCheckType};
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one distribution algorithm and one non-empty target group
/// - No target listed twice
/// - Non-zero connect and sticky timeouts
/// - HTTP health checks have paths, script health checks have commands
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing the problem.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.algorithms.is_empty() {
        errors.push("at least one distribution algorithm must be defined".to_string());
    }

    if config.target_groups.is_empty() {
        errors.push("at least one target group must be defined".to_string());
    }

    if config.connect_timeout == Duration::ZERO {
        errors.push("connect_timeout must be greater than zero".to_string());
    }

    for algorithm in &config.algorithms {
        if let AlgorithmConfig::StickyHash { sticky_timeout } = algorithm {
            if *sticky_timeout == Duration::ZERO {
                errors.push("sticky_timeout must be greater than zero".to_string());
            }
        }
    }

    let mut seen = HashSet::new();
    for (index, group) in config.target_groups.iter().enumerate() {
        if group.targets.is_empty() {
            errors.push(format!("target group {} must have at least one target", index));
        }

        for target in &group.targets {
            if !seen.insert(*target) {
                errors.push(format!("duplicate target: {}", target));
            }
        }
    }

    if let Some(ref hc) = config.health_check {
        if hc.check_type == HealthCheckType::Http && hc.path.is_none() {
            errors.push("HTTP health check has no path specified".to_string());
        }
        if hc.check_type == HealthCheckType::Script && hc.command.is_none() {
            errors.push("script health check has no command specified".to_string());
        }
        if hc.interval == Duration::ZERO {
            errors.push("health check interval must be greater than zero".to_string());
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
