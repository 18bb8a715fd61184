//! Process-wide logging and metrics initialization.
//!
//! `LogConfig`/`init_logging` follow the same call shape the worker and
//! daemon binaries use (`LogConfig::from_env("info").with_stderr()` then
//! `init_logging`), extended here with optional JSON formatting for
//! production and an optional non-blocking file appender.

pub mod metrics;

use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging configuration, built up with a builder-style API.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    stderr: bool,
    json: bool,
    file: Option<PathBuf>,
}

impl LogConfig {
    /// Start from `RUST_LOG` if set, else `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
        Self {
            level,
            stderr: false,
            json: false,
            file: None,
        }
    }

    /// Derive sensible defaults from [`tcg_common::config::AppConfig`]:
    /// JSON formatting in production, plain text otherwise.
    pub fn from_app_config(config: &tcg_common::config::AppConfig, default_level: &str) -> Self {
        Self::from_env(default_level).with_json(config.is_production())
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

/// Holds the non-blocking writer guard(s); dropping this flushes pending log
/// lines. Callers must bind it to a name for the process lifetime (not `_`).
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global tracing subscriber. Must be called exactly once per
/// process, as early as possible in `main`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard, tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let mut file_guard = None;
    let file_layer = config.file.as_ref().map(|path| {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tcg.log")
            .to_string();
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        fmt::layer().with_writer(non_blocking).with_ansi(false)
    });

    if config.json {
        let stderr_layer = config
            .stderr
            .then(|| fmt::layer().json().with_writer(std::io::stderr));
        registry.with(stderr_layer).with(file_layer).try_init()?;
    } else {
        let stderr_layer = config.stderr.then(|| fmt::layer().with_writer(std::io::stderr));
        registry.with(stderr_layer).with(file_layer).try_init()?;
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains_apply() {
        let config = LogConfig::from_env("info")
            .with_level("debug")
            .with_stderr()
            .with_json(true);
        assert_eq!(config.level, "debug");
        assert!(config.stderr);
        assert!(config.json);
    }
}
