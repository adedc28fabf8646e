//! Configuration management for PackDB

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure for PackDB
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Default options for newly created tables
    #[serde(default)]
    pub table: TableOptions,

    /// Logging configuration
    #[serde(default)]
    pub logging: LogConfig,
}

impl Config {
    /// Load configuration from a TOML or JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: Config = if path.as_ref().extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?
        };

        config.table.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to storage directory
    pub path: String,
    /// Page cache capacity of the KV store
    pub cache_size_bytes: usize,
    /// Compress column blocks with lz4
    pub compression_enabled: bool,
    /// Background flush interval of the KV store in milliseconds (0 = off)
    pub flush_every_ms: u64,
    /// Use a temporary store that is removed on drop
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
            cache_size_bytes: 64 * 1024 * 1024,
            compression_enabled: true,
            flush_every_ms: 500,
            temporary: false,
        }
    }
}

/// Per-table tuning knobs, persisted with the table on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Maximum number of rows per pack
    pub pack_size: usize,
    /// Journal capacity (live rows + tombstones) before a flush is triggered
    pub journal_size: usize,
    /// Block cache capacity in bytes (0 disables the cache)
    pub cache_size_bytes: usize,
    /// Pending writes after which a flush commits and reopens its transaction
    pub tx_max_pending: usize,
    /// Target pack fill level in percent
    pub fill_level: u8,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            pack_size: 1 << 16,
            journal_size: 1 << 17,
            cache_size_bytes: 16 * 1024 * 1024,
            tx_max_pending: 1024,
            fill_level: 90,
        }
    }
}

impl TableOptions {
    /// Reject option combinations the storage core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.pack_size == 0 || self.pack_size > u32::MAX as usize {
            return Err(Error::Config(format!("invalid pack size {}", self.pack_size)));
        }
        if self.journal_size == 0 {
            return Err(Error::Config("journal size must be positive".into()));
        }
        if self.tx_max_pending == 0 {
            return Err(Error::Config("tx_max_pending must be positive".into()));
        }
        if self.fill_level == 0 || self.fill_level > 100 {
            return Err(Error::Config(format!("invalid fill level {}", self.fill_level)));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_pack_size(mut self, n: usize) -> Self {
        self.pack_size = n;
        self
    }

    #[must_use]
    pub fn with_journal_size(mut self, n: usize) -> Self {
        self.journal_size = n;
        self
    }

    #[must_use]
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_tx_max_pending(mut self, n: usize) -> Self {
        self.tx_max_pending = n;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when RUST_LOG is not set
    pub level: String,
    /// Emit JSON formatted lines
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_options_are_valid() {
        assert!(TableOptions::default().validate().is_ok());
        assert!(TableOptions::default().with_pack_size(0).validate().is_err());
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packdb.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[table]\npack_size = 1024\n\n[logging]\njson = true").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.table.pack_size, 1024);
        assert_eq!(config.table.journal_size, 1 << 17);
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_json_rejects_bad_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packdb.json");
        std::fs::write(&path, r#"{"table": {"fill_level": 0}}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }
}
