//! Platform configuration file format.
//!
//! Loads [`PlatformConfig`] from a TOML file (`platform.toml`) with
//! environment variable overrides via `NPUOP_*` prefixed variables. The
//! resulting [`HardwareProfile`] stands in for the platform capability
//! oracle when tiling runs outside a graph compiler.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::hardware::{HardwareProfile, SocTag, DEFAULT_ALIGN_BYTES};

/// Fixed system workspace every kernel launch reserves (16 MiB).
pub const DEFAULT_SYSTEM_WORKSPACE_BYTES: u64 = 16 * 1024 * 1024;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    /// Override: `NPUOP_LOG_LEVEL`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Platform configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// SoC architecture tag (e.g. `Ascend910B`).
    /// Override: `NPUOP_SOC`
    pub soc: SocTag,

    /// Number of vector cores.
    /// Override: `NPUOP_CORE_COUNT`
    pub core_count: u64,

    /// Fast buffer size per core in bytes.
    /// Override: `NPUOP_UB_BYTES`
    pub ub_bytes: u64,

    /// DMA block alignment in bytes.
    /// Override: `NPUOP_ALIGN_BYTES`
    pub align_bytes: u64,

    /// Reserved system workspace in bytes.
    /// Override: `NPUOP_SYSTEM_WORKSPACE`
    pub system_workspace_bytes: u64,

    /// Prefer deterministic kernel variants where a family offers one.
    /// Override: `NPUOP_DETERMINISTIC`
    pub deterministic: bool,

    pub logging: LoggingConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let caps = SocTag::Ascend910B.capabilities();
        Self {
            soc: SocTag::Ascend910B,
            core_count: caps.default_core_count,
            ub_bytes: caps.default_ub_bytes,
            align_bytes: DEFAULT_ALIGN_BYTES,
            system_workspace_bytes: DEFAULT_SYSTEM_WORKSPACE_BYTES,
            deterministic: false,
            logging: LoggingConfig::default(),
        }
    }
}

/// Errors that can occur when loading or validating a [`PlatformConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl PlatformConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading platform config");
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: PlatformConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_count == 0 {
            return Err(ConfigError::Validation("core_count must be > 0".into()));
        }
        if self.ub_bytes == 0 {
            return Err(ConfigError::Validation("ub_bytes must be > 0".into()));
        }
        if !self.align_bytes.is_power_of_two() {
            return Err(ConfigError::Validation(format!(
                "align_bytes must be a power of two, got {}",
                self.align_bytes
            )));
        }
        if self.ub_bytes < self.align_bytes {
            return Err(ConfigError::Validation(format!(
                "ub_bytes ({}) must hold at least one aligned block of {} bytes",
                self.ub_bytes, self.align_bytes
            )));
        }
        if self.logging.level.is_empty() {
            return Err(ConfigError::Validation("logging.level must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `NPUOP_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("NPUOP_SOC") {
            self.soc = val.parse::<SocTag>().map_err(|reason| ConfigError::EnvOverride {
                key: "NPUOP_SOC".into(),
                value: val.clone(),
                reason,
            })?;
        }

        self.core_count = env_u64("NPUOP_CORE_COUNT")?.unwrap_or(self.core_count);
        self.ub_bytes = env_u64("NPUOP_UB_BYTES")?.unwrap_or(self.ub_bytes);
        self.align_bytes = env_u64("NPUOP_ALIGN_BYTES")?.unwrap_or(self.align_bytes);
        self.system_workspace_bytes =
            env_u64("NPUOP_SYSTEM_WORKSPACE")?.unwrap_or(self.system_workspace_bytes);

        if let Ok(val) = std::env::var("NPUOP_DETERMINISTIC") {
            self.deterministic = matches!(val.as_str(), "1" | "true" | "yes");
        }

        if let Ok(val) = std::env::var("NPUOP_LOG_LEVEL") {
            self.logging.level = val;
        }

        Ok(())
    }

    /// Freeze into the planner's hardware profile.
    pub fn hardware_profile(&self) -> HardwareProfile {
        HardwareProfile::new(self.soc, self.core_count, self.ub_bytes)
            .with_align_bytes(self.align_bytes)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => {
            debug!(key, value = %val, "environment override");
            val.parse::<u64>().map(Some).map_err(|e| ConfigError::EnvOverride {
                key: key.into(),
                value: val.clone(),
                reason: e.to_string(),
            })
        }
        Err(_) => Ok(None),
    }
}
