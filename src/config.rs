//! Runtime configuration for the transport and unit factories.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: fields assigned on [`RpcConfig`] after loading
//! 2. **Environment variables**: values from `INTERRUPTIBLE_RPC_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`RpcConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `INTERRUPTIBLE_RPC_MAX_FRAME_LEN` | `usize` | `max_frame_len` |
//! | `INTERRUPTIBLE_RPC_TCP_NODELAY` | `bool` | `tcp_nodelay` |
//! | `INTERRUPTIBLE_RPC_UNIT_NAME_PREFIX` | `String` | `unit_name_prefix` |
//! | `INTERRUPTIBLE_RPC_UNIT_STACK_SIZE` | `usize` | `unit_stack_size` |

use crate::rpc::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable name for the maximum frame length.
pub const ENV_MAX_FRAME_LEN: &str = "INTERRUPTIBLE_RPC_MAX_FRAME_LEN";
/// Environment variable name for the `TCP_NODELAY` toggle.
pub const ENV_TCP_NODELAY: &str = "INTERRUPTIBLE_RPC_TCP_NODELAY";
/// Environment variable name for the unit thread name prefix.
pub const ENV_UNIT_NAME_PREFIX: &str = "INTERRUPTIBLE_RPC_UNIT_NAME_PREFIX";
/// Environment variable name for the unit thread stack size.
pub const ENV_UNIT_STACK_SIZE: &str = "INTERRUPTIBLE_RPC_UNIT_STACK_SIZE";

/// Smallest frame limit accepted; anything lower cannot carry a request.
pub const MIN_FRAME_LEN: usize = 64;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that does not parse.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Human-readable expected type.
        expected: &'static str,
        /// Raw value found.
        value: String,
    },
    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Transport and unit factory settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Largest frame body either side will read or write.
    pub max_frame_len: usize,
    /// Whether sockets opened by the transport factory set `TCP_NODELAY`.
    pub tcp_nodelay: bool,
    /// Thread name prefix for units; the unit id is appended.
    pub unit_name_prefix: String,
    /// Stack size for unit threads, `None` for the platform default.
    pub unit_stack_size: Option<usize>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            tcp_nodelay: true,
            unit_name_prefix: "rpc-unit".to_string(),
            unit_stack_size: None,
        }
    }
}

impl RpcConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// Only variables that are set are applied. A set variable with an
    /// unparseable value is an error.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable source.
    ///
    /// `lookup` maps a variable name to its value, if set.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup(ENV_MAX_FRAME_LEN) {
            self.max_frame_len = parse_usize(ENV_MAX_FRAME_LEN, &val)?;
        }
        if let Some(val) = lookup(ENV_TCP_NODELAY) {
            self.tcp_nodelay = parse_bool(ENV_TCP_NODELAY, &val)?;
        }
        if let Some(val) = lookup(ENV_UNIT_NAME_PREFIX) {
            self.unit_name_prefix = val;
        }
        if let Some(val) = lookup(ENV_UNIT_STACK_SIZE) {
            self.unit_stack_size = Some(parse_usize(ENV_UNIT_STACK_SIZE, &val)?);
        }
        Ok(())
    }

    /// Checks field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(ConfigError::Invalid {
                field: "max_frame_len",
                reason: format!(
                    "{} is below the minimum of {MIN_FRAME_LEN}",
                    self.max_frame_len
                ),
            });
        }
        if u32::try_from(self.max_frame_len).is_err() {
            return Err(ConfigError::Invalid {
                field: "max_frame_len",
                reason: "does not fit the 4-byte length prefix".to_string(),
            });
        }
        if self.unit_name_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "unit_name_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        if self.unit_stack_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "unit_stack_size",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Parses a TOML document. Missing keys keep their defaults.
    ///
    /// ```toml
    /// max_frame_len = 65536
    /// tcp_nodelay = false
    /// unit_name_prefix = "lock-unit"
    /// ```
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file, then applies environment overrides on top.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}
