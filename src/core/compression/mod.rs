//! Compression engine: codecs, automatic selection and streaming
//!
//! **Codecs** (code stored in the header flags and in each FileEntry):
//! - `None` (0): bytes stored as-is
//! - `Zstd` (1): balanced ratio and speed, levels 1-22
//! - `Lz4` (2): fastest, level ignored, size-prepended block format
//! - `Lzma` (3): best ratio, xz container, levels 0-9
//!
//! Failures are surfaced as [`PackageError::Compression`]. Nothing here ever
//! falls back to storing data uncompressed on its own.

pub mod memory;
pub mod strategy;
pub mod stream;

pub use strategy::{select_compression, ContentProfile};
pub use stream::{StreamConfig, StreamingCompressor};

use crate::error::{PackageError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Zstd = 1,
    Lz4 = 2,
    Lzma = 3,
}

impl CompressionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zstd),
            2 => Some(CompressionType::Lz4),
            3 => Some(CompressionType::Lzma),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Zstd => "zstd",
            CompressionType::Lz4 => "lz4",
            CompressionType::Lzma => "lzma",
        }
    }

    pub fn default_level(self) -> u8 {
        match self {
            CompressionType::None | CompressionType::Lz4 => 0,
            CompressionType::Zstd => 3,
            CompressionType::Lzma => 6,
        }
    }

    /// Resolve a requested level (0 = codec default) and range-check it
    pub fn effective_level(self, level: u8) -> Result<u8> {
        let max = match self {
            CompressionType::None | CompressionType::Lz4 => return Ok(0),
            CompressionType::Zstd => 22,
            CompressionType::Lzma => 9,
        };
        if level == 0 {
            return Ok(self.default_level());
        }
        if level > max {
            return Err(PackageError::invalid(
                "CompressionLevel",
                format!("{} supports levels up to {}, got {}", self.name(), max, level),
            ));
        }
        Ok(level)
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn codec_error(compression: CompressionType, message: impl std::fmt::Display) -> PackageError {
    PackageError::Compression {
        algorithm: compression.name(),
        message: message.to_string(),
    }
}

/// Compress `data` with `compression` at `level` (0 = codec default)
pub fn compress(data: &[u8], compression: CompressionType, level: u8) -> Result<Vec<u8>> {
    let level = compression.effective_level(level)?;
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => {
            zstd::bulk::compress(data, level as i32).map_err(|e| codec_error(compression, e))
        }
        CompressionType::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionType::Lzma => {
            let mut encoder = xz2::write::XzEncoder::new(Vec::new(), level as u32);
            encoder
                .write_all(data)
                .map_err(|e| codec_error(compression, e))?;
            encoder.finish().map_err(|e| codec_error(compression, e))
        }
    }
}

/// Inverse of [`compress`]
pub fn decompress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => {
            zstd::stream::decode_all(data).map_err(|e| codec_error(compression, e))
        }
        CompressionType::Lz4 => {
            lz4_flex::decompress_size_prepended(data).map_err(|e| codec_error(compression, e))
        }
        CompressionType::Lzma => {
            let mut decoder = xz2::read::XzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| codec_error(compression, e))?;
            Ok(out)
        }
    }
}

/// Decompress into a buffer of known size, rejecting any other length
pub fn decompress_exact(
    data: &[u8],
    compression: CompressionType,
    expected_len: u64,
) -> Result<Vec<u8>> {
    let out = decompress(data, compression)?;
    if out.len() as u64 != expected_len {
        return Err(codec_error(
            compression,
            format!(
                "decompressed to {} bytes, expected {}",
                out.len(),
                expected_len
            ),
        ));
    }
    Ok(out)
}
