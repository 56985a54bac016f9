//! Core configuration.
//!
//! Every field has a default so `StudioConfig::default()` is a working
//! single-instance setup. All types deserialize, so a deployment can load
//! overrides from a TOML file and leave the rest defaulted.

use std::time::Duration;

use serde::Deserialize;

use crate::quota::RoleTables;
use crate::security::rate_limit::{RateLimitRule, default_rules};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub scheduler: SchedulerConfig,
    pub security: SecurityConfig,
    pub quotas: RoleTables,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard cap on simultaneously executing tasks.
    pub max_concurrent_tasks: usize,
    /// Deadline for a single Execute call. Expiry fails the task.
    pub execution_timeout_secs: u64,
    /// How long the loop waits on an empty queue before checking for idleness.
    pub idle_poll_interval_ms: u64,
    /// Terminal tasks older than this are removed by the cleanup sweep.
    pub retention_days: i64,
}

impl SchedulerConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs.max(1))
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.max(0))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            execution_timeout_secs: 15 * 60,
            idle_poll_interval_ms: 5_000,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Failed logins within the window before the source IP is blocked.
    pub max_failed_attempts: usize,
    pub failed_attempt_window_secs: i64,
    /// Retained security events; the oldest are evicted first.
    pub event_log_capacity: usize,
    pub trusted_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub rate_limit_rules: Vec<RateLimitRule>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            failed_attempt_window_secs: 3_600,
            event_log_capacity: 1_000,
            trusted_ips: Vec::new(),
            blocked_ips: Vec::new(),
            rate_limit_rules: default_rules(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_limits() {
        let cfg = StudioConfig::default();
        assert_eq!(cfg.scheduler.max_concurrent_tasks, 5);
        assert_eq!(cfg.scheduler.retention(), chrono::Duration::days(7));
        assert_eq!(cfg.security.max_failed_attempts, 5);
        assert_eq!(cfg.security.event_log_capacity, 1_000);
        let names: Vec<_> = cfg
            .security
            .rate_limit_rules
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, ["api_general", "auth", "generation", "upload"]);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg: StudioConfig = toml::from_str(
            r#"
            [scheduler]
            max_concurrent_tasks = 2

            [security]
            trusted_ips = ["203.0.113.7"]
            "#,
        )
        .expect("valid toml");
        assert_eq!(cfg.scheduler.max_concurrent_tasks, 2);
        assert_eq!(cfg.scheduler.retention_days, 7);
        assert_eq!(cfg.security.trusted_ips, ["203.0.113.7"]);
        assert_eq!(cfg.security.rate_limit_rules.len(), 4);
    }
}
