//! Package configuration, loadable from TOML
//!
//! ```toml
//! [compression]
//! default_type = "unspecified"   # or none / zstd / lz4 / lzma
//! archival = false
//!
//! [streaming]
//! chunk_size = 0                 # auto
//! worker_count = 4
//!
//! [dedup]
//! raw = true
//! processed = false
//! final = false
//!
//! [buffer_pool]
//! max_total_bytes = 268435456
//! idle_timeout_secs = 30
//!
//! [write]
//! fast_write_fallback = "safe_write"
//! compute_crc = true
//! sync = true
//! ```

use crate::buffer_pool::BufferPoolConfig;
use crate::compression::{CompressionType, StreamConfig};
use crate::dedup::DedupConfig;
use crate::error::{PackageError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Compression requested for new content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionChoice {
    /// Pick from the package content profile
    #[default]
    Unspecified,
    None,
    Zstd,
    Lz4,
    Lzma,
}

impl CompressionChoice {
    /// `None` means automatic selection
    pub fn resolve(self) -> Option<CompressionType> {
        match self {
            CompressionChoice::Unspecified => None,
            CompressionChoice::None => Some(CompressionType::None),
            CompressionChoice::Zstd => Some(CompressionType::Zstd),
            CompressionChoice::Lz4 => Some(CompressionType::Lz4),
            CompressionChoice::Lzma => Some(CompressionType::Lzma),
        }
    }
}

impl From<Option<CompressionType>> for CompressionChoice {
    fn from(value: Option<CompressionType>) -> Self {
        match value {
            None => CompressionChoice::Unspecified,
            Some(CompressionType::None) => CompressionChoice::None,
            Some(CompressionType::Zstd) => CompressionChoice::Zstd,
            Some(CompressionType::Lz4) => CompressionChoice::Lz4,
            Some(CompressionType::Lzma) => CompressionChoice::Lzma,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CompressionConfig {
    pub default_type: CompressionChoice,
    /// Overrides the per-type level when non-zero
    #[validate(range(max = 22))]
    pub level: u8,
    /// Prefer ratio over speed when selecting automatically
    pub archival: bool,
    #[validate(range(min = 1, max = 22))]
    pub zstd_level: u8,
    #[validate(range(max = 9))]
    pub lzma_level: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            default_type: CompressionChoice::Unspecified,
            level: 0,
            archival: false,
            zstd_level: CompressionType::Zstd.default_level(),
            lzma_level: CompressionType::Lzma.default_level(),
        }
    }
}

impl CompressionConfig {
    /// Level to use for `compression`, range-checked against the codec
    pub fn level_for(&self, compression: CompressionType) -> Result<u8> {
        let configured = match (self.level, compression) {
            (0, CompressionType::Zstd) => self.zstd_level,
            (0, CompressionType::Lzma) => self.lzma_level,
            (level, _) => level,
        };
        compression.effective_level(configured)
    }
}

/// What to do when FastWrite preconditions fail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastWriteFallback {
    Error,
    #[default]
    SafeWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub fast_write_fallback: FastWriteFallback,
    /// Compute the package CRC on write (0 is stored otherwise)
    pub compute_crc: bool,
    /// fsync the file (and its directory on rename) before returning
    pub sync: bool,
}

impl Default for WriteConfig {
    fn default() -> Self {
        WriteConfig {
            fast_write_fallback: FastWriteFallback::SafeWrite,
            compute_crc: true,
            sync: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PackageConfig {
    #[validate(nested)]
    pub compression: CompressionConfig,
    pub streaming: StreamConfig,
    pub dedup: DedupConfig,
    #[validate(nested)]
    pub buffer_pool: BufferPoolConfig,
    pub write: WriteConfig,
}

impl PackageConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PackageConfig =
            toml::from_str(text).map_err(|e| PackageError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PackageError::io_at("read config", path, None, e))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PackageError::Config(e.to_string()))
    }

    /// Run every validation rule, including the ones outside the derive
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| PackageError::Config(e.to_string()))?;
        self.streaming.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = PackageConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.compression.default_type.resolve(), None);
        assert!(config.dedup.raw);
        assert!(config.write.compute_crc);
        assert_eq!(config.write.fast_write_fallback, FastWriteFallback::SafeWrite);
    }

    #[test]
    fn test_parse_toml() {
        let config = PackageConfig::from_toml_str(
            r#"
            [compression]
            default_type = "lzma"
            lzma_level = 9

            [streaming]
            worker_count = 2
            adaptive_chunking = true

            [dedup]
            raw = true
            final = true

            [write]
            fast_write_fallback = "error"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.compression.default_type.resolve(),
            Some(CompressionType::Lzma)
        );
        assert_eq!(config.compression.level_for(CompressionType::Lzma).unwrap(), 9);
        assert_eq!(config.streaming.worker_count, 2);
        assert!(config.dedup.final_stage);
        assert!(!config.dedup.processed);
        assert_eq!(config.write.fast_write_fallback, FastWriteFallback::Error);
    }

    #[test]
    fn test_out_of_range_level_rejected() {
        let err = PackageConfig::from_toml_str("[compression]\nlzma_level = 12\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_bad_chunk_size_rejected() {
        let err = PackageConfig::from_toml_str("[streaming]\nchunk_size = 100\n").unwrap_err();
        assert!(matches!(err, PackageError::Config(_)));
    }

    #[test]
    fn test_level_override() {
        let mut config = CompressionConfig::default();
        assert_eq!(config.level_for(CompressionType::Zstd).unwrap(), 3);
        assert_eq!(config.level_for(CompressionType::Lz4).unwrap(), 0);
        config.level = 19;
        assert_eq!(config.level_for(CompressionType::Zstd).unwrap(), 19);
        assert!(config.level_for(CompressionType::Lzma).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvpk.toml");
        let original = PackageConfig::default();
        std::fs::write(&path, original.to_toml_string().unwrap()).unwrap();
        let loaded = PackageConfig::load(&path).unwrap();
        assert_eq!(loaded.compression, original.compression);
        assert_eq!(loaded.write, original.write);
    }
}
