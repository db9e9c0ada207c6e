//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::alloc::AllocatorVariant;
use crate::store::StoreConfig;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HopstoreConfig {
    /// Store configuration.
    pub store: Option<StoreSection>,
    /// Pool configuration.
    pub pool: Option<PoolSection>,
}

impl HopstoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `HOPSTORE_CONFIG` env var (if set), then
    /// apply `HOPSTORE__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("HOPSTORE_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("HOPSTORE__") {
                continue;
            }
            let path = key["HOPSTORE__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["store", "base_buckets"] => {
                    self.store_mut().base_buckets = Some(parse_value(&key, &value)?);
                }
                ["store", "load_factor"] => {
                    self.store_mut().load_factor = Some(parse_value(&key, &value)?);
                }
                ["store", "allocator"] => {
                    self.store_mut().allocator = Some(parse_allocator(&key, &value)?);
                }
                ["pool", "directory"] => {
                    self.pool_mut().directory = Some(PathBuf::from(value));
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a [`StoreConfig`] using defaults plus overrides.
    pub fn to_store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::default();
        if let Some(store) = &self.store {
            store.apply_to(&mut config);
        }
        config
    }

    /// Default pool directory, if configured.
    pub fn pool_directory(&self) -> Option<&Path> {
        self.pool.as_ref()?.directory.as_deref()
    }

    fn store_mut(&mut self) -> &mut StoreSection {
        self.store.get_or_insert_with(StoreSection::default)
    }

    fn pool_mut(&mut self) -> &mut PoolSection {
        self.pool.get_or_insert_with(PoolSection::default)
    }
}

/// Store configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Buckets in segment 0.
    pub base_buckets: Option<u64>,
    /// Load-factor threshold that triggers a resize.
    pub load_factor: Option<f64>,
    /// Region allocator variant: `free-list` or `extent-tree`.
    pub allocator: Option<AllocatorVariant>,
}

impl StoreSection {
    fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.base_buckets {
            config.base_buckets = value;
        }
        if let Some(value) = self.load_factor {
            config.load_factor = value.clamp(0.1, 1.0);
        }
        if let Some(value) = self.allocator {
            config.allocator = value;
        }
    }
}

/// Pool configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolSection {
    /// Default directory for pool files.
    pub directory: Option<PathBuf>,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_allocator(key: &str, value: &str) -> Result<AllocatorVariant, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "free-list" => Ok(AllocatorVariant::FreeList),
        "extent-tree" => Ok(AllocatorVariant::ExtentTree),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
