#![forbid(unsafe_code)]

//! Transaction manager configuration.
//!
//! ```toml
//! # planstate.toml
//! max_undo_step = 50
//! enabled = true
//! ```
//!
//! ```rust,ignore
//! let config = TransactionConfig::from_toml_file("planstate.toml")?.validated()?;
//! let manager = TransactionManager::from_config(&config);
//! ```
//!
//! Loading from files needs the `config` feature. Missing keys take their
//! defaults.

use std::fmt;
#[cfg(feature = "config")]
use std::path::{Path, PathBuf};

#[cfg(feature = "config")]
use serde::{Deserialize, Serialize};

use crate::undo::DEFAULT_MAX_UNDO_STEP;

/// Largest accepted history bound.
pub const MAX_UNDO_STEP_LIMIT: usize = 10_000;

/// Settings applied when a [`TransactionManager`](crate::TransactionManager)
/// is built.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
pub struct TransactionConfig {
    /// Undo entries kept per session (0 keeps none).
    pub max_undo_step: usize,
    /// Whether history starts enabled.
    pub enabled: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_undo_step: DEFAULT_MAX_UNDO_STEP,
            enabled: true,
        }
    }
}

impl TransactionConfig {
    /// Load from a TOML string.
    #[cfg(feature = "config")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Toml)
    }

    /// Load from a TOML file on disk.
    #[cfg(feature = "config")]
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_config(path.as_ref())?)
    }

    /// Load from a JSON string.
    #[cfg(feature = "config")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(ConfigError::Json)
    }

    /// Load from a JSON file on disk.
    #[cfg(feature = "config")]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&read_config(path.as_ref())?)
    }

    /// Problems with the current values; empty when valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_undo_step > MAX_UNDO_STEP_LIMIT {
            errors.push(format!(
                "max_undo_step must be at most {MAX_UNDO_STEP_LIMIT}, got {}",
                self.max_undo_step
            ));
        }
        errors
    }

    /// `self` if valid, otherwise [`ConfigError::Validation`].
    pub fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

#[cfg(feature = "config")]
fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Why a [`TransactionConfig`] could not be used.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[cfg(feature = "config")]
    Read {
        /// File that was asked for.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The text is not a TOML config table.
    #[cfg(feature = "config")]
    Toml(toml::de::Error),
    /// The text is not a JSON config object.
    #[cfg(feature = "config")]
    Json(serde_json::Error),
    /// The values were parsed but are out of range.
    Validation(Vec<String>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "config")]
            Self::Read { path, source } => {
                write!(f, "cannot read transaction config {}: {source}", path.display())
            }
            #[cfg(feature = "config")]
            Self::Toml(e) => write!(f, "transaction config is not valid TOML: {e}"),
            #[cfg(feature = "config")]
            Self::Json(e) => write!(f, "transaction config is not valid JSON: {e}"),
            Self::Validation(problems) => {
                write!(f, "invalid transaction config: {}", problems.join("; "))
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "config")]
            Self::Read { source, .. } => Some(source),
            #[cfg(feature = "config")]
            Self::Toml(e) => Some(e),
            #[cfg(feature = "config")]
            Self::Json(e) => Some(e),
            Self::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.max_undo_step, 25);
        assert!(config.enabled);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn oversized_bound_fails_validation() {
        let config = TransactionConfig {
            max_undo_step: MAX_UNDO_STEP_LIMIT + 1,
            enabled: true,
        };
        let err = config.validated().unwrap_err();
        assert!(
            err.to_string()
                .starts_with("invalid transaction config: max_undo_step")
        );
        assert!(std::error::Error::source(&err).is_none());
    }

    #[cfg(feature = "config")]
    #[test]
    fn partial_toml_keeps_defaults() {
        let config = TransactionConfig::from_toml_str("enabled = false").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_undo_step, 25);
    }

    #[cfg(feature = "config")]
    #[test]
    fn json_round_trip() {
        let config = TransactionConfig::from_json_str(r#"{"max_undo_step": 3}"#).unwrap();
        assert_eq!(config.max_undo_step, 3);
        let err = TransactionConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[cfg(feature = "config")]
    #[test]
    fn missing_file_names_the_path() {
        let err = TransactionConfig::from_toml_file("/nonexistent/planstate.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/planstate.toml"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
