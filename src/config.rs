//! Configuration loading.
//!
//! Typed settings structs plus a TOML schema with environment overrides:
//! `SPLICEKV_CONFIG` names a config file, and `SPLICEKV__section__field`
//! variables override individual fields.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

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

/// Read-cache sizing. Absence of this struct disables the read cache.
#[derive(Debug, Clone, Copy)]
pub struct ReadCacheSettings {
    /// log2 of the cache memory budget in bytes.
    pub memory_size_bits: u32,
    /// log2 of the cache page size in bytes.
    pub page_size_bits: u32,
}

impl Default for ReadCacheSettings {
    fn default() -> Self {
        Self {
            memory_size_bits: 26, // 64 MiB
            page_size_bits: 20,   // 1 MiB pages
        }
    }
}

/// Hybrid-log sizing.
#[derive(Debug, Clone, Copy)]
pub struct LogSettings {
    /// log2 of the in-memory budget in bytes.
    pub memory_size_bits: u32,
    /// log2 of the page size in bytes.
    pub page_size_bits: u32,
    /// Read-cache sizing; `None` disables the read cache.
    pub read_cache: Option<ReadCacheSettings>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            memory_size_bits: 28, // 256 MiB
            page_size_bits: 22,   // 4 MiB pages
            read_cache: Some(ReadCacheSettings::default()),
        }
    }
}

/// Store-wide settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Number of hash buckets (power of two).
    pub table_size: u64,
    /// Hybrid-log sizing.
    pub log: LogSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            table_size: 1 << 20,
            log: LogSettings::default(),
        }
    }
}

impl StoreSettings {
    /// Page-size bits of the read cache, falling back to the log's when
    /// the cache is disabled.
    pub fn read_cache_page_size_bits(&self) -> u32 {
        self.log
            .read_cache
            .as_ref()
            .map(|rc| rc.page_size_bits)
            .unwrap_or(self.log.page_size_bits)
    }
}

/// TOML schema mirrored onto [`StoreSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SplicekvConfig {
    /// `[store]` section.
    pub store: Option<StoreSection>,
    /// `[log]` section.
    pub log: Option<LogSection>,
    /// `[read_cache]` section.
    pub read_cache: Option<ReadCacheSection>,
}

/// `[store]` fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Number of hash buckets.
    pub table_size: Option<u64>,
}

/// `[log]` fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    /// log2 of the in-memory budget.
    pub memory_size_bits: Option<u32>,
    /// log2 of the page size.
    pub page_size_bits: Option<u32>,
}

/// `[read_cache]` fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadCacheSection {
    /// Whether the read cache is enabled.
    pub enabled: Option<bool>,
    /// log2 of the cache memory budget.
    pub memory_size_bits: Option<u32>,
    /// log2 of the cache page size.
    pub page_size_bits: Option<u32>,
}

impl SplicekvConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load from the `SPLICEKV_CONFIG` file (if set), then apply
    /// `SPLICEKV__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("SPLICEKV_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("SPLICEKV__") {
                continue;
            }
            let path = key["SPLICEKV__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["store", "table_size"] => {
                    self.store_mut().table_size = Some(parse_value(&key, &value)?);
                }
                ["log", "memory_size_bits"] => {
                    self.log_mut().memory_size_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "page_size_bits"] => {
                    self.log_mut().page_size_bits = Some(parse_value(&key, &value)?);
                }
                ["read_cache", "enabled"] => {
                    self.read_cache_mut().enabled = Some(parse_value(&key, &value)?);
                }
                ["read_cache", "memory_size_bits"] => {
                    self.read_cache_mut().memory_size_bits = Some(parse_value(&key, &value)?);
                }
                ["read_cache", "page_size_bits"] => {
                    self.read_cache_mut().page_size_bits = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Materialize [`StoreSettings`] from defaults plus this schema.
    pub fn to_settings(&self) -> StoreSettings {
        let mut settings = StoreSettings::default();
        if let Some(store) = &self.store {
            if let Some(size) = store.table_size {
                settings.table_size = size;
            }
        }
        if let Some(log) = &self.log {
            if let Some(bits) = log.memory_size_bits {
                settings.log.memory_size_bits = bits;
            }
            if let Some(bits) = log.page_size_bits {
                settings.log.page_size_bits = bits;
            }
        }
        if let Some(rc) = &self.read_cache {
            if rc.enabled == Some(false) {
                settings.log.read_cache = None;
            } else {
                let mut cache = settings.log.read_cache.unwrap_or_default();
                if let Some(bits) = rc.memory_size_bits {
                    cache.memory_size_bits = bits;
                }
                if let Some(bits) = rc.page_size_bits {
                    cache.page_size_bits = bits;
                }
                settings.log.read_cache = Some(cache);
            }
        }
        settings
    }

    fn store_mut(&mut self) -> &mut StoreSection {
        self.store.get_or_insert_with(Default::default)
    }

    fn log_mut(&mut self) -> &mut LogSection {
        self.log.get_or_insert_with(Default::default)
    }

    fn read_cache_mut(&mut self) -> &mut ReadCacheSection {
        self.read_cache.get_or_insert_with(Default::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = StoreSettings::default();
        assert!(settings.table_size.is_power_of_two());
        assert!(settings.log.read_cache.is_some());
    }

    #[test]
    fn test_toml_round_trip() {
        let config: SplicekvConfig = toml::from_str(
            r#"
            [store]
            table_size = 4096

            [log]
            memory_size_bits = 20
            page_size_bits = 14

            [read_cache]
            memory_size_bits = 18
            page_size_bits = 14
            "#,
        )
        .unwrap();

        let settings = config.to_settings();
        assert_eq!(settings.table_size, 4096);
        assert_eq!(settings.log.memory_size_bits, 20);
        assert_eq!(settings.log.page_size_bits, 14);
        let rc = settings.log.read_cache.unwrap();
        assert_eq!(rc.memory_size_bits, 18);
        assert_eq!(rc.page_size_bits, 14);
    }

    #[test]
    fn test_read_cache_disabled() {
        let config: SplicekvConfig = toml::from_str(
            r#"
            [read_cache]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(config.to_settings().log.read_cache.is_none());
    }

    // One test owns all SPLICEKV__ variables; overrides scan the whole
    // environment, so split tests would race each other.
    #[test]
    fn test_env_overrides() {
        let mut config = SplicekvConfig::default();
        env::set_var("SPLICEKV__bogus__field", "1");
        let err = config.apply_env_overrides().unwrap_err();
        env::remove_var("SPLICEKV__bogus__field");
        assert!(matches!(err, ConfigError::UnknownKey(_)));

        let mut config = SplicekvConfig::default();
        env::set_var("SPLICEKV__store__table_size", "8192");
        env::set_var("SPLICEKV__read_cache__enabled", "false");
        config.apply_env_overrides().unwrap();
        env::remove_var("SPLICEKV__store__table_size");
        env::remove_var("SPLICEKV__read_cache__enabled");

        let settings = config.to_settings();
        assert_eq!(settings.table_size, 8192);
        assert!(settings.log.read_cache.is_none());
    }
}
