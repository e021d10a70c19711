//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (TENANTCORE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [database]
//! path = "/var/lib/tenantcore/tenantcore.db"
//!
//! [limits]
//! view_max_rows = 500
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! TENANTCORE_DATABASE__PATH=/custom/path.db
//! TENANTCORE_SCHEMA__LOCK=noop
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relational backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long a writer waits for the database file lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Schema evolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Days a renamed object stays reachable under its old name
    #[serde(default = "default_alias_grace_days")]
    pub alias_grace_days: i64,

    /// Keyed lock implementation guarding schema mutation
    #[serde(default)]
    pub lock: LockMode,

    /// Milliseconds to wait for a held schema lock. 0 = fail immediately.
    #[serde(default)]
    pub lock_wait_ms: u64,
}

/// Schema lock implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Process-local keyed mutex (single engine process per database)
    #[default]
    InProcess,
    /// Transaction-scoped backend advisory lock (namespaced dialect)
    Advisory,
    /// No locking, for single-writer deployments
    Noop,
}

/// Row and complexity caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Global hard cap on rows returned by a view
    #[serde(default = "default_view_max_rows")]
    pub view_max_rows: usize,

    /// Maximum filters in one view definition
    #[serde(default = "default_view_max_filters")]
    pub view_max_filters: usize,

    /// Maximum joins in one view definition
    #[serde(default = "default_view_max_joins")]
    pub view_max_joins: usize,

    /// Page size for record listing when the caller gives none
    #[serde(default = "default_list_default_limit")]
    pub list_default_limit: usize,

    /// Largest page size for record listing
    #[serde(default = "default_list_max_limit")]
    pub list_max_limit: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("./data/tenantcore.db")
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_alias_grace_days() -> i64 {
    30
}
fn default_view_max_rows() -> usize {
    1000
}
fn default_view_max_filters() -> usize {
    20
}
fn default_view_max_joins() -> usize {
    1
}
fn default_list_default_limit() -> usize {
    50
}
fn default_list_max_limit() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (TENANTCORE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("TENANTCORE_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TENANTCORE_").split("__"))
            .extract()
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl SchemaConfig {
    pub fn alias_grace(&self) -> chrono::Duration {
        chrono::Duration::days(self.alias_grace_days)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            alias_grace_days: default_alias_grace_days(),
            lock: LockMode::default(),
            lock_wait_ms: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            view_max_rows: default_view_max_rows(),
            view_max_filters: default_view_max_filters(),
            view_max_joins: default_view_max_joins(),
            list_default_limit: default_list_default_limit(),
            list_max_limit: default_list_max_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
