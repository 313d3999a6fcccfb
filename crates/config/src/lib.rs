//! Configuration loading, validation, and scope policy tables for spendgate.
//!
//! Loads configuration from `~/.spendgate/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! The `[[teams]]` and `[[keys]]` tables are the scope policy directory:
//! request authentication is an external collaborator, so the limits,
//! overdrafts, and modes the Precedence Resolver needs come from here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spendgate_core::BudgetMode;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.spendgate/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Ledger database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Reservation lifecycle configuration
    #[serde(default)]
    pub reservations: ReservationConfig,

    /// Team budget policies
    #[serde(default)]
    pub teams: Vec<TeamPolicy>,

    /// Virtual key budget policies
    #[serde(default)]
    pub keys: Vec<KeyPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path, or "sqlite::memory:" for an ephemeral ledger.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    AppConfig::config_dir()
        .join("ledger.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42810
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// How long a hold lives before the sweep reclaims it. Must be set
    /// generously longer than the gateway's maximum request timeout so
    /// reclaim never races a legitimately slow in-flight request.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Interval between expiry sweep cycles.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum reservations reversed per sweep cycle.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: u32,
}

fn default_ttl_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_sweep_batch() -> u32 {
    100
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

/// Budget policy for a team scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamPolicy {
    pub id: String,

    /// Monthly limit in USD (decimal string in TOML, e.g. "25.00").
    pub limit_usd: Decimal,

    #[serde(default)]
    pub overdraft_usd: Decimal,

    #[serde(default)]
    pub mode: BudgetMode,
}

/// Budget policy for a virtual key scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub id: String,

    /// The team that owns this key.
    pub team: String,

    pub limit_usd: Decimal,

    #[serde(default)]
    pub overdraft_usd: Decimal,

    #[serde(default)]
    pub mode: BudgetMode,
}

impl AppConfig {
    /// Load configuration from the default path (~/.spendgate/config.toml).
    ///
    /// Environment variable overrides (highest priority):
    /// - `SPENDGATE_CONFIG` — alternate config file path
    /// - `SPENDGATE_DB_PATH` — ledger database path
    /// - `SPENDGATE_PORT` — gateway port
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("SPENDGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&config_path)?;

        if let Ok(path) = std::env::var("SPENDGATE_DB_PATH") {
            config.database.path = path;
        }

        if let Ok(port) = std::env::var("SPENDGATE_PORT") {
            config.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("SPENDGATE_PORT is not a port: {port:?}"))
            })?;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".spendgate")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reservations.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reservations.ttl_secs must be > 0".into(),
            ));
        }
        if self.reservations.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reservations.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.reservations.sweep_batch == 0 {
            return Err(ConfigError::ValidationError(
                "reservations.sweep_batch must be > 0".into(),
            ));
        }

        let mut team_ids = std::collections::HashSet::new();
        for team in &self.teams {
            if team.limit_usd < Decimal::ZERO || team.overdraft_usd < Decimal::ZERO {
                return Err(ConfigError::ValidationError(format!(
                    "team {:?}: monetary amounts must be >= 0",
                    team.id
                )));
            }
            if !team_ids.insert(team.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate team id: {:?}",
                    team.id
                )));
            }
        }

        let mut key_ids = std::collections::HashSet::new();
        for key in &self.keys {
            if key.limit_usd < Decimal::ZERO || key.overdraft_usd < Decimal::ZERO {
                return Err(ConfigError::ValidationError(format!(
                    "key {:?}: monetary amounts must be >= 0",
                    key.id
                )));
            }
            if !key_ids.insert(key.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate key id: {:?}",
                    key.id
                )));
            }
            if !team_ids.contains(key.team.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "key {:?} references unknown team {:?}",
                    key.id, key.team
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            reservations: ReservationConfig::default(),
            teams: vec![],
            keys: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
