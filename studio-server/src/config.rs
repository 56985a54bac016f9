//! Server configuration, loaded from environment variables at startup.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use studio_core::StudioConfig;
use thiserror::Error;

/// Runtime configuration for studio-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Optional TOML file with `StudioConfig` overrides.
    pub config_path: Option<PathBuf>,

    /// Overrides `scheduler.max_concurrent_tasks` from the TOML file.
    pub max_concurrent: Option<usize>,
    pub exec_timeout_secs: Option<u64>,
    pub retention_days: Option<i64>,

    /// Root directory for generated artifacts.
    pub storage_dir: PathBuf,

    /// Comma-separated list of allowed CORS origins. `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Bearer token guarding `/admin`. `None` leaves admin routes open.
    pub admin_token: Option<String>,

    /// Peers whose `x-forwarded-for` header is believed. Empty means the
    /// socket address is always the client IP.
    pub trusted_proxies: Vec<IpAddr>,

    /// Register unknown callers as standard users on their first task.
    pub auto_register: bool,

    /// Delay between progress steps of the simulated executor.
    pub sim_step_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".into(),
            log_level: "info".into(),
            log_json: false,
            config_path: None,
            max_concurrent: None,
            exec_timeout_secs: None,
            retention_days: None,
            storage_dir: PathBuf::from("studio-data"),
            cors_allowed_origins: None,
            admin_token: None,
            trusted_proxies: Vec::new(),
            auto_register: true,
            sim_step_ms: 250,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: env_or("STUDIO_BIND", &defaults.bind_address),
            log_level: env_or("STUDIO_LOG", &defaults.log_level),
            log_json: env_flag("STUDIO_LOG_JSON", defaults.log_json),
            config_path: env_opt("STUDIO_CONFIG").map(PathBuf::from),
            max_concurrent: env_opt("STUDIO_MAX_CONCURRENT").and_then(|v| v.parse().ok()),
            exec_timeout_secs: env_opt("STUDIO_EXEC_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            retention_days: env_opt("STUDIO_RETENTION_DAYS").and_then(|v| v.parse().ok()),
            storage_dir: env_opt("STUDIO_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            cors_allowed_origins: env_opt("STUDIO_CORS_ORIGINS"),
            admin_token: env_opt("STUDIO_ADMIN_TOKEN"),
            trusted_proxies: env_opt("STUDIO_TRUSTED_PROXIES")
                .map(|v| parse_ip_list(&v))
                .unwrap_or_default(),
            auto_register: env_flag("STUDIO_AUTO_REGISTER", defaults.auto_register),
            sim_step_ms: parse_env("STUDIO_SIM_STEP_MS", defaults.sim_step_ms),
        }
    }

    /// The core configuration: the TOML file (if any) with the env overrides
    /// applied on top.
    pub fn studio_config(&self) -> Result<StudioConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => load_toml(path)?,
            None => StudioConfig::default(),
        };
        if let Some(n) = self.max_concurrent {
            config.scheduler.max_concurrent_tasks = n;
        }
        if let Some(secs) = self.exec_timeout_secs {
            config.scheduler.execution_timeout_secs = secs;
        }
        if let Some(days) = self.retention_days {
            config.scheduler.retention_days = days;
        }
        Ok(config)
    }
}

fn load_toml(path: &Path) -> Result<StudioConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Unset or blank variables count as absent.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Comma-separated IPs; entries that do not parse are dropped.
fn parse_ip_list(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .filter_map(|ip| ip.trim().parse().ok())
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_win_over_defaults() {
        let cfg = Config {
            max_concurrent: Some(9),
            retention_days: Some(1),
            ..Config::default()
        };
        let core = cfg.studio_config().unwrap();
        assert_eq!(core.scheduler.max_concurrent_tasks, 9);
        assert_eq!(core.scheduler.retention_days, 1);
        assert_eq!(core.scheduler.execution_timeout_secs, 15 * 60);
    }

    #[test]
    fn toml_file_is_layered_under_env() {
        let path = std::env::temp_dir().join(format!("studio-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[scheduler]\nmax_concurrent_tasks = 3\nexecution_timeout_secs = 60\n",
        )
        .unwrap();
        let cfg = Config {
            config_path: Some(path.clone()),
            exec_timeout_secs: Some(30),
            ..Config::default()
        };
        let core = cfg.studio_config().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(core.scheduler.max_concurrent_tasks, 3);
        assert_eq!(core.scheduler.execution_timeout_secs, 30);
    }

    #[test]
    fn trusted_proxy_list_skips_garbage() {
        assert_eq!(
            parse_ip_list("10.0.0.1, ::1,not-an-ip,,192.0.2.7"),
            vec![
                IpAddr::from([10, 0, 0, 1]),
                "::1".parse::<IpAddr>().unwrap(),
                IpAddr::from([192, 0, 2, 7]),
            ]
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cfg = Config {
            config_path: Some(PathBuf::from("/nonexistent/studio.toml")),
            ..Config::default()
        };
        assert!(matches!(cfg.studio_config(), Err(ConfigError::Read { .. })));
    }
}
