//! Automatic compression selection

use super::CompressionType;
use crate::classify::FileTypeTag;

/// Below this total size compression is not worth its overhead
pub const AUTO_COMPRESSION_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Package-wide content statistics feeding [`select_compression`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentProfile {
    pub total_size: u64,
    pub file_count: u64,
    /// Bytes belonging to files that are already compressed media
    pub compressed_media_size: u64,
}

impl ContentProfile {
    pub fn add(&mut self, size: u64, tag: FileTypeTag) {
        self.total_size += size;
        self.file_count += 1;
        if tag.is_compressed_media() {
            self.compressed_media_size += size;
        }
    }

    pub fn from_files<I>(files: I) -> Self
    where
        I: IntoIterator<Item = (u64, FileTypeTag)>,
    {
        let mut profile = ContentProfile::default();
        for (size, tag) in files {
            profile.add(size, tag);
        }
        profile
    }

    pub fn average_file_size(&self) -> u64 {
        if self.file_count == 0 {
            0
        } else {
            self.total_size / self.file_count
        }
    }

    /// More than half of the content is already-compressed media
    pub fn is_mostly_compressed_media(&self) -> bool {
        self.compressed_media_size * 2 > self.total_size
    }
}

/// Choose a codec for content described by `profile`
pub fn select_compression(profile: &ContentProfile, archival: bool) -> CompressionType {
    if profile.total_size < AUTO_COMPRESSION_THRESHOLD {
        CompressionType::None
    } else if profile.is_mostly_compressed_media() {
        CompressionType::Lz4
    } else if archival {
        CompressionType::Lzma
    } else {
        CompressionType::Zstd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_small_packages_stay_uncompressed() {
        let profile = ContentProfile::from_files([(1024, FileTypeTag::Text)]);
        assert_eq!(select_compression(&profile, false), CompressionType::None);
        assert_eq!(select_compression(&profile, true), CompressionType::None);
    }

    #[test]
    fn test_media_heavy_prefers_lz4() {
        let profile = ContentProfile::from_files([
            (8 * MB, FileTypeTag::Video),
            (4 * MB, FileTypeTag::Text),
        ]);
        assert!(profile.is_mostly_compressed_media());
        assert_eq!(select_compression(&profile, true), CompressionType::Lz4);
    }

    #[test]
    fn test_archival_prefers_lzma() {
        let profile = ContentProfile::from_files([(20 * MB, FileTypeTag::Text)]);
        assert_eq!(select_compression(&profile, true), CompressionType::Lzma);
        assert_eq!(select_compression(&profile, false), CompressionType::Zstd);
    }

    #[test]
    fn test_half_media_is_not_majority() {
        let profile = ContentProfile::from_files([
            (6 * MB, FileTypeTag::Image),
            (6 * MB, FileTypeTag::Document),
        ]);
        assert_eq!(profile.average_file_size(), 6 * MB);
        assert_eq!(select_compression(&profile, false), CompressionType::Zstd);
    }
}
