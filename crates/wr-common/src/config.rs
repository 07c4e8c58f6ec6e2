//! Process configuration.
//!
//! Values come from a `.env` file in TOML form when present, with process
//! environment variables taking precedence over file entries.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::{RelayError, Result};

const ENV_FILE: &str = ".env";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub redis_db: i64,
    pub routes_file: String,
    /// Default TTL applied to delivered events, overridable per route.
    pub delivered_ttl_hours: u64,
    /// Default TTL applied to failed events, overridable per route.
    pub failed_ttl_hours: u64,
    pub telemetry_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: String::new(),
            redis_db: 0,
            routes_file: "routes.yaml".to_string(),
            delivered_ttl_hours: 1,
            failed_ttl_hours: 24,
            telemetry_enabled: false,
        }
    }
}

impl AppConfig {
    /// Load from `./.env` (TOML) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(ENV_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let file = read_env_file(path.as_ref())?;
        let lookup = |key: &str| -> Option<String> {
            std::env::var(key).ok().or_else(|| file.get(key).cloned())
        };

        let defaults = AppConfig::default();
        Ok(Self {
            port: parse_or(lookup("PORT"), defaults.port, "PORT")?,
            redis_host: lookup("REDIS_HOST").unwrap_or(defaults.redis_host),
            redis_port: parse_or(lookup("REDIS_PORT"), defaults.redis_port, "REDIS_PORT")?,
            redis_password: lookup("REDIS_PASSWORD").unwrap_or_default(),
            redis_db: parse_or(lookup("REDIS_DB"), defaults.redis_db, "REDIS_DB")?,
            routes_file: lookup("ROUTES_FILE").unwrap_or(defaults.routes_file),
            delivered_ttl_hours: parse_or(
                lookup("WEBHOOK_DELIVERED_TTL_HOURS"),
                defaults.delivered_ttl_hours,
                "WEBHOOK_DELIVERED_TTL_HOURS",
            )?,
            failed_ttl_hours: parse_or(
                lookup("WEBHOOK_FAILED_TTL_HOURS"),
                defaults.failed_ttl_hours,
                "WEBHOOK_FAILED_TTL_HOURS",
            )?,
            telemetry_enabled: parse_or(
                lookup("TELEMETRY_ENABLED"),
                defaults.telemetry_enabled,
                "TELEMETRY_ENABLED",
            )?,
        })
    }

    /// Connection URL for the redis client, including password and db index.
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis_password, self.redis_host, self.redis_port, self.redis_db
            )
        }
    }

    pub fn delivered_ttl(&self) -> Duration {
        Duration::from_secs(self.delivered_ttl_hours * 3600)
    }

    pub fn failed_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_ttl_hours * 3600)
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("reading {}: {e}", path.display())))?;
    let table: toml::Table = raw
        .parse()
        .map_err(|e| RelayError::Config(format!("parsing {}: {e}", path.display())))?;

    Ok(table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T, key: &str) -> Result<T> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| RelayError::Config(format!("invalid value for {key}: {raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.routes_file, "routes.yaml");
        assert_eq!(cfg.delivered_ttl_hours, 1);
        assert_eq!(cfg.failed_ttl_hours, 24);
        assert!(!cfg.telemetry_enabled);
    }

    #[test]
    fn redis_url_formats() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.redis_url(), "redis://127.0.0.1:6379/0");

        cfg.redis_password = "hunter2".to_string();
        cfg.redis_db = 3;
        assert_eq!(cfg.redis_url(), "redis://:hunter2@127.0.0.1:6379/3");
    }

    #[test]
    fn missing_env_file_yields_defaults() {
        let cfg = AppConfig::load_from("definitely-not-here.env").unwrap();
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn ttl_helpers_convert_hours() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.delivered_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.failed_ttl(), Duration::from_secs(24 * 3600));
    }
}
