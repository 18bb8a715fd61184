//! Environment-variable configuration loading.
//!
//! Follows the shape of `rch_common::config::env::EnvParser`: a type-safe
//! accessor collects parse/missing-variable errors as it goes so the caller
//! can report every configuration problem at once instead of failing on the
//! first missing variable.

use std::path::PathBuf;
use thiserror::Error;

/// Errors accumulated while parsing environment variables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Collects environment values with defaults, accumulating errors.
struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn get_string(&mut self, name: &'static str, default: &str) -> String {
        std::env::var(name).unwrap_or_else(|_| default.to_string())
    }

    fn get_required_string(&mut self, name: &'static str) -> String {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                self.errors.push(EnvError::Missing(name));
                String::new()
            }
        }
    }

    fn get_u16(&mut self, name: &'static str, default: u16) -> u16 {
        match std::env::var(name) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                self.errors.push(EnvError::Invalid { var: name, value });
                default
            }),
            Err(_) => default,
        }
    }
}

/// Process-wide configuration, loaded once at startup and passed explicitly
/// from there on (never re-read from the environment mid-run), matching the
/// teacher's "credential and model-name read once at startup" design note.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub node_env: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub github_token: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub host_clone_base_path: PathBuf,
    /// Docker daemon endpoint override for the sandbox runner; `None` means
    /// let `bollard` use its platform default (unix socket / named pipe).
    pub docker_host: Option<String>,
    /// Container image used to populate and run the toolchain volume.
    pub sandbox_image: String,
}

impl AppConfig {
    /// True when running in a production-like environment (enables JSON log
    /// formatting in `tcg-telemetry::LogConfig::from_app_config`).
    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }

    /// Load configuration from the process environment. Loads `.env` first
    /// (development convenience, mirrors `rch_common::config::dotenv`),
    /// silently ignoring a missing file.
    pub fn from_env() -> Result<Self, Vec<EnvError>> {
        let _ = dotenvy::dotenv();
        let mut parser = EnvParser::new();

        let config = Self {
            node_env: parser.get_string("NODE_ENV", "development"),
            port: parser.get_u16("PORT", 3000),
            db_path: PathBuf::from(parser.get_string("DB_PATH", "database.sqlite")),
            github_token: parser.get_required_string("GITHUB_TOKEN"),
            gemini_api_key: parser.get_required_string("GEMINI_API_KEY"),
            gemini_model: parser.get_string("GEMINI_MODEL", "gemini-2.0-flash-lite"),
            redis_host: parser.get_string("REDIS_HOST", "127.0.0.1"),
            redis_port: parser.get_u16("REDIS_PORT", 6379),
            host_clone_base_path: PathBuf::from(
                parser.get_string("HOST_CLONE_BASE_PATH", "/tmp/clones"),
            ),
            docker_host: std::env::var("DOCKER_HOST").ok(),
            sandbox_image: parser.get_string("SANDBOX_IMAGE", "node:20-bullseye"),
        };

        if parser.errors.is_empty() {
            Ok(config)
        } else {
            Err(parser.errors)
        }
    }

    /// The `redis://host:port` connection string the queue client connects to.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = env_lock();
        // SAFETY: serialized by env_lock; no other thread touches these vars.
        unsafe {
            std::env::remove_var("PORT");
            std::env::remove_var("DB_PATH");
            std::env::set_var("GITHUB_TOKEN", "ghp_test");
            std::env::set_var("GEMINI_API_KEY", "test-key");
        }
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("database.sqlite"));
        assert_eq!(config.gemini_model, "gemini-2.0-flash-lite");
    }

    #[test]
    fn missing_required_vars_are_accumulated() {
        let _guard = env_lock();
        unsafe {
            std::env::remove_var("GITHUB_TOKEN");
            std::env::remove_var("GEMINI_API_KEY");
        }
        let errors = AppConfig::from_env().expect_err("should report missing vars");
        assert!(errors.contains(&EnvError::Missing("GITHUB_TOKEN")));
        assert!(errors.contains(&EnvError::Missing("GEMINI_API_KEY")));
    }
}
