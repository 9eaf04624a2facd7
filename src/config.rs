//! Service configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty document
//! only needs its `root_keys` filled in:
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! attempt_timeout_ms = 20000
//! wait_between_ms = 200
//!
//! [wrapping]
//! default_root = "root"
//!
//! [[root_keys]]
//! name = "root"
//! passphrase = "..."
//! salt = "..."
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SoftHsmError;
use crate::wrapping::WRAPPING_ALGORITHM;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub wait_between_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 20_000,
            wait_between_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn wait_between(&self) -> Duration {
        Duration::from_millis(self.wait_between_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl CacheConfig {
    fn with_max(max_entries: usize) -> Self {
        Self { max_entries }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WrappingConfig {
    pub algorithm: String,
    /// Root used when a tenant is provisioned without an explicit parent.
    pub default_root: String,
}

impl Default for WrappingConfig {
    fn default() -> Self {
        Self {
            algorithm: WRAPPING_ALGORITHM.to_string(),
            default_root: "root".to_string(),
        }
    }
}

/// A configuration-resident ("unmanaged") root wrapping key.
#[derive(Clone, Deserialize)]
pub struct RootKeyConfig {
    pub name: String,
    pub passphrase: String,
    pub salt: String,
}

impl fmt::Debug for RootKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKeyConfig")
            .field("name", &self.name)
            .field("passphrase", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoftHsmConfig {
    pub retry: RetryConfig,
    pub wrapping_key_cache: CacheConfig,
    pub short_hash_cache: CacheConfig,
    pub wrapping: WrappingConfig,
    pub root_keys: Vec<RootKeyConfig>,
}

impl Default for SoftHsmConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            wrapping_key_cache: CacheConfig::with_max(100),
            short_hash_cache: CacheConfig::with_max(10_000),
            wrapping: WrappingConfig::default(),
            root_keys: Vec::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::with_max(100)
    }
}

impl SoftHsmConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, SoftHsmError> {
        let config: Self = toml::from_str(text).map_err(|e| SoftHsmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SoftHsmError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SoftHsmError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// A single root derived from the given secrets, otherwise defaults.
    pub fn with_root(name: &str, passphrase: &str, salt: &str) -> Self {
        let mut config = Self::default();
        config.wrapping.default_root = name.to_string();
        config.root_keys.push(RootKeyConfig {
            name: name.to_string(),
            passphrase: passphrase.to_string(),
            salt: salt.to_string(),
        });
        config
    }

    pub fn validate(&self) -> Result<(), SoftHsmError> {
        if self.retry.max_attempts == 0 {
            return Err(SoftHsmError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.wrapping.algorithm != WRAPPING_ALGORITHM {
            return Err(SoftHsmError::Config(format!(
                "unsupported wrapping algorithm '{}'",
                self.wrapping.algorithm
            )));
        }
        if self.root_keys.is_empty() {
            return Err(SoftHsmError::Config("at least one root key is required".into()));
        }
        if let Some(blank) = self
            .root_keys
            .iter()
            .find(|r| r.name.trim().is_empty() || r.passphrase.is_empty() || r.salt.is_empty())
        {
            return Err(SoftHsmError::Config(format!(
                "root key '{}' needs a name, passphrase and salt",
                blank.name
            )));
        }
        if !self
            .root_keys
            .iter()
            .any(|r| r.name == self.wrapping.default_root)
        {
            return Err(SoftHsmError::Config(format!(
                "default root '{}' is not among root_keys",
                self.wrapping.default_root
            )));
        }
        Ok(())
    }
}
