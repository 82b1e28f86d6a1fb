//! Host-supplied configuration for queries and mirror bootstrap.
//!
//! # Invariants
//! - `query_result_limit` is greater than zero.
//! - Mirror keys are non-blank and unique; mirror URLs are absolute.

use crate::model::neuron::is_absolute_url;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

pub const DEFAULT_QUERY_RESULT_LIMIT: u32 = 1000;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    ZeroQueryResultLimit,
    BlankMirrorKey,
    DuplicateMirrorKey(String),
    InvalidMirrorUrl { key: String, url: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read configuration: {err}"),
            Self::Parse(err) => write!(f, "failed to parse configuration: {err}"),
            Self::ZeroQueryResultLimit => {
                write!(f, "query_result_limit must be greater than zero")
            }
            Self::BlankMirrorKey => write!(f, "mirror key cannot be blank"),
            Self::DuplicateMirrorKey(key) => write!(f, "duplicate mirror key `{key}`"),
            Self::InvalidMirrorUrl { key, url } => {
                write!(f, "mirror `{key}` has non-absolute url `{url}`")
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// One configured mirror: a lookup key and the external URL its neuron carries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MirrorConfig {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Cap on items a restricted store query may return.
    pub query_result_limit: u32,
    pub mirrors: Vec<MirrorConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            query_result_limit: DEFAULT_QUERY_RESULT_LIMIT,
            mirrors: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Parses and validates JSON configuration.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.query_result_limit == 0 {
            return Err(ConfigError::ZeroQueryResultLimit);
        }

        let mut seen = BTreeSet::new();
        for mirror in &self.mirrors {
            let key = mirror.key.trim();
            if key.is_empty() {
                return Err(ConfigError::BlankMirrorKey);
            }
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateMirrorKey(key.to_string()));
            }
            if !is_absolute_url(&mirror.url) {
                return Err(ConfigError::InvalidMirrorUrl {
                    key: key.to_string(),
                    url: mirror.url.clone(),
                });
            }
        }
        Ok(())
    }

    /// Returns the mirror configured under `key` (trimmed match).
    pub fn mirror(&self, key: &str) -> Option<&MirrorConfig> {
        let key = key.trim();
        self.mirrors.iter().find(|mirror| mirror.key.trim() == key)
    }
}
