//! Structured logging
//!
//! Pretty output for development, JSON for production. Filtering goes through
//! `EnvFilter`; an explicit filter string wins over the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::error::{LedgerError, LedgerResult};

/// Log level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include source file and line
    pub include_source: bool,
    /// `EnvFilter` directive, e.g. `ledger_engine=debug,reqwest=warn`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_source: true,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            include_source: false,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            ..Self::default()
        }
    }

    /// Read `LEDGER_LOG_LEVEL`, `LEDGER_LOG_FORMAT` and `RUST_LOG`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = std::env::var("LEDGER_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::from_str(&v))
        {
            config.level = level;
        }
        if let Some(format) = std::env::var("LEDGER_LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::from_str(&v))
        {
            config.format = format;
        }
        config.filter = std::env::var("RUST_LOG").ok().filter(|v| !v.is_empty());
        config
    }

    fn env_filter(&self) -> LedgerResult<EnvFilter> {
        let directive = match &self.filter {
            Some(filter) => filter.clone(),
            None => format!("ledger_engine={}", self.level),
        };
        EnvFilter::try_new(&directive)
            .map_err(|e| LedgerError::Configuration(format!("bad log filter '{}': {}", directive, e)))
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> LedgerResult<()> {
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.include_source)
            .with_line_number(config.include_source)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.include_source)
            .with_line_number(config.include_source)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.include_source)
            .with_line_number(config.include_source)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(config.env_filter()?)
        .try_init()
        .map_err(|e| LedgerError::Configuration(format!("logging already initialized: {}", e)))
}
