use crate::codec::FieldReader;
use crate::compression::CompressionType;
use crate::error::{PackageError, Result};

/// "NVPK" read as a little-endian u32
pub const MAGIC: u32 = 0x4E56_504B;
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 112;
/// IndexSize written while an in-place update is in progress
pub const INDEX_SIZE_INCOMPLETE: u64 = 0;

/// Package feature flags (Flags bits 0-7)
pub const FLAG_HAS_SIGNATURES: u32 = 1 << 0;
pub const FLAG_HAS_COMPRESSED_FILES: u32 = 1 << 1;
pub const FLAG_HAS_ENCRYPTED_FILES: u32 = 1 << 2;
pub const FLAG_HAS_EXTENDED_ATTRS: u32 = 1 << 3;
pub const FLAG_HAS_PACKAGE_COMMENT: u32 = 1 << 4;
pub const FLAG_HAS_PER_FILE_TAGS: u32 = 1 << 5;
pub const FLAG_HAS_SPECIAL_METADATA: u32 = 1 << 6;
pub const FLAG_METADATA_ONLY: u32 = 1 << 7;

const FLAGS_MASK_FEATURES: u32 = 0x0000_00FF;
const FLAGS_MASK_COMPRESSION: u32 = 0x0000_FF00;
const FLAGS_MASK_RESERVED: u32 = 0xFFFF_0000;
const FLAGS_SHIFT_COMPRESSION: u32 = 8;

/// Package header (first 112 bytes of every package file)
///
/// The header locates the index, comment and signature chain, and carries
/// package identity (vendor/app/creator ids) plus the package-wide
/// compression type in bits 8-15 of `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub format_version: u32,
    pub flags: u32,
    /// Bumped whenever file content changes
    pub package_data_version: u32,
    /// Bumped whenever package metadata changes
    pub metadata_version: u32,
    /// CRC32 of bytes `[HEADER_SIZE, end of comment)`, 0 if skipped
    pub package_crc: u32,
    /// Unix nanoseconds
    pub created_time: i64,
    /// Unix nanoseconds
    pub modified_time: i64,
    pub locale_id: u32,
    pub reserved: u32,
    pub app_id: u64,
    pub vendor_id: u32,
    pub creator_id: u32,
    pub index_start: u64,
    pub index_size: u64,
    /// Shared by all parts of a multi-part archive
    pub archive_chain_id: u64,
    /// Part number (high 16 bits) and total parts (low 16 bits)
    pub archive_part_info: u32,
    pub comment_size: u32,
    pub comment_start: u64,
    /// Offset of the first signature block, 0 if unsigned
    pub signature_offset: u64,
}

impl Header {
    /// Create a header for a fresh, empty package
    pub fn new() -> Self {
        Header {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            flags: 0,
            package_data_version: 1,
            metadata_version: 1,
            package_crc: 0,
            created_time: 0,
            modified_time: 0,
            locale_id: 0,
            reserved: 0,
            app_id: 0,
            vendor_id: 0,
            creator_id: 0,
            index_start: 0,
            index_size: 0,
            archive_chain_id: 0,
            archive_part_info: 0x0001_0001,
            comment_size: 0,
            comment_start: 0,
            signature_offset: 0,
        }
    }

    /// Package-wide compression type (flags bits 8-15)
    pub fn compression_type(&self) -> Result<CompressionType> {
        let code = ((self.flags & FLAGS_MASK_COMPRESSION) >> FLAGS_SHIFT_COMPRESSION) as u8;
        CompressionType::from_u8(code).ok_or(PackageError::InvalidCompressionType(code))
    }

    pub fn set_compression_type(&mut self, compression: CompressionType) {
        self.flags &= !FLAGS_MASK_COMPRESSION;
        self.flags |= (compression as u32) << FLAGS_SHIFT_COMPRESSION;
    }

    pub fn features(&self) -> u8 {
        (self.flags & FLAGS_MASK_FEATURES) as u8
    }

    pub fn has_feature(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_feature(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.flags |= flag & FLAGS_MASK_FEATURES;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn archive_part(&self) -> u16 {
        (self.archive_part_info >> 16) as u16
    }

    pub fn archive_total(&self) -> u16 {
        (self.archive_part_info & 0xFFFF) as u16
    }

    pub fn set_archive_part_info(&mut self, part: u16, total: u16) {
        self.archive_part_info = ((part as u32) << 16) | total as u32;
    }

    pub fn is_signed(&self) -> bool {
        self.signature_offset > 0
    }

    /// End of the region covered by the package CRC (`[HEADER_SIZE, end)`)
    pub fn crc_range_end(&self) -> u64 {
        let index_end = self.index_start + self.index_size;
        let comment_end = self.comment_start + self.comment_size as u64;
        index_end.max(comment_end)
    }

    pub fn has_comment(&self) -> bool {
        self.comment_size > 0
    }

    /// Validate magic, version, reserved fields and type codes
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(PackageError::InvalidMagic {
                found: self.magic,
                expected: MAGIC,
            });
        }

        if self.format_version != FORMAT_VERSION {
            return Err(PackageError::UnsupportedVersion(self.format_version));
        }

        if self.reserved != 0 {
            return Err(PackageError::ReservedNotZero {
                structure: "Header",
                field: "Reserved",
                value: self.reserved as u64,
            });
        }

        if self.flags & FLAGS_MASK_RESERVED != 0 {
            return Err(PackageError::ReservedNotZero {
                structure: "Header",
                field: "Flags",
                value: (self.flags & FLAGS_MASK_RESERVED) as u64,
            });
        }

        self.compression_type()?;

        if (self.comment_size == 0) != (self.comment_start == 0) {
            return Err(PackageError::malformed(
                "Header",
                "CommentStart",
                format!(
                    "comment size {} and start {} must both be zero or both be set",
                    self.comment_size, self.comment_start
                ),
            ));
        }

        if self.archive_part() > self.archive_total() {
            return Err(PackageError::malformed(
                "Header",
                "ArchivePartInfo",
                format!(
                    "part {} exceeds total {}",
                    self.archive_part(),
                    self.archive_total()
                ),
            ));
        }

        Ok(())
    }

    /// Check every offset/length pair against the length of the file
    pub fn validate_bounds(&self, file_len: u64) -> Result<()> {
        check_range("IndexStart", self.index_start, self.index_size, file_len)?;
        if self.index_size > 0 && self.index_start < HEADER_SIZE as u64 {
            return Err(PackageError::OutOfBounds {
                structure: "Header",
                field: "IndexStart",
                offset: self.index_start,
                length: self.index_size,
                limit: HEADER_SIZE as u64,
            });
        }
        check_range(
            "CommentStart",
            self.comment_start,
            self.comment_size as u64,
            file_len,
        )?;
        check_range("SignatureOffset", self.signature_offset, 0, file_len)?;
        Ok(())
    }

    /// Serialize header to bytes
    ///
    /// Encoding is deterministic: equal headers always produce equal bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.format_version.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.package_data_version.to_le_bytes());
        bytes.extend_from_slice(&self.metadata_version.to_le_bytes());
        bytes.extend_from_slice(&self.package_crc.to_le_bytes());
        bytes.extend_from_slice(&self.created_time.to_le_bytes());
        bytes.extend_from_slice(&self.modified_time.to_le_bytes());
        bytes.extend_from_slice(&self.locale_id.to_le_bytes());
        bytes.extend_from_slice(&self.reserved.to_le_bytes());
        bytes.extend_from_slice(&self.app_id.to_le_bytes());
        bytes.extend_from_slice(&self.vendor_id.to_le_bytes());
        bytes.extend_from_slice(&self.creator_id.to_le_bytes());
        bytes.extend_from_slice(&self.index_start.to_le_bytes());
        bytes.extend_from_slice(&self.index_size.to_le_bytes());
        bytes.extend_from_slice(&self.archive_chain_id.to_le_bytes());
        bytes.extend_from_slice(&self.archive_part_info.to_le_bytes());
        bytes.extend_from_slice(&self.comment_size.to_le_bytes());
        bytes.extend_from_slice(&self.comment_start.to_le_bytes());
        bytes.extend_from_slice(&self.signature_offset.to_le_bytes());

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(bytes, "Header");

        // Magic first so a foreign file reports a magic mismatch, not truncation
        let magic = r.u32("Magic")?;
        if magic != MAGIC {
            return Err(PackageError::InvalidMagic {
                found: magic,
                expected: MAGIC,
            });
        }

        let header = Header {
            magic,
            format_version: r.u32("FormatVersion")?,
            flags: r.u32("Flags")?,
            package_data_version: r.u32("PackageDataVersion")?,
            metadata_version: r.u32("MetadataVersion")?,
            package_crc: r.u32("PackageCRC")?,
            created_time: r.i64("CreatedTime")?,
            modified_time: r.i64("ModifiedTime")?,
            locale_id: r.u32("LocaleID")?,
            reserved: r.u32("Reserved")?,
            app_id: r.u64("AppID")?,
            vendor_id: r.u32("VendorID")?,
            creator_id: r.u32("CreatorID")?,
            index_start: r.u64("IndexStart")?,
            index_size: r.u64("IndexSize")?,
            archive_chain_id: r.u64("ArchiveChainID")?,
            archive_part_info: r.u32("ArchivePartInfo")?,
            comment_size: r.u32("CommentSize")?,
            comment_start: r.u64("CommentStart")?,
            signature_offset: r.u64("SignatureOffset")?,
        };
        debug_assert_eq!(r.position(), HEADER_SIZE);

        header.validate()?;
        Ok(header)
    }
}

fn check_range(field: &'static str, offset: u64, length: u64, limit: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(PackageError::OutOfBounds {
            structure: "Header",
            field,
            offset,
            length,
            limit,
        }),
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_header() -> Header {
        let mut header = Header::new();
        header.flags = FLAG_HAS_PACKAGE_COMMENT | FLAG_HAS_PER_FILE_TAGS;
        header.set_compression_type(CompressionType::Zstd);
        header.created_time = 1_700_000_000_000_000_000;
        header.modified_time = -5;
        header.locale_id = 0x0409;
        header.app_id = 0xDEAD_BEEF_0000_0001;
        header.vendor_id = 0x4749_5448;
        header.creator_id = 7;
        header.index_start = 500;
        header.index_size = 48;
        header.archive_chain_id = 99;
        header.set_archive_part_info(2, 3);
        header.comment_size = 12;
        header.comment_start = 548;
        header
    }

    #[test]
    fn test_header_creation() {
        let header = Header::new();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.format_version, FORMAT_VERSION);
        assert_eq!(header.archive_part(), 1);
        assert_eq!(header.archive_total(), 1);
        assert!(!header.is_signed());
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_header_serialization() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], b"KPVN");

        let decoded = Header::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.compression_type().unwrap(), CompressionType::Zstd);
        assert_eq!(decoded.archive_part(), 2);
        assert_eq!(decoded.archive_total(), 3);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let header = sample_header();
        let copy = header;
        assert_eq!(header.to_bytes(), copy.to_bytes());
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = Header::new().to_bytes();
        bytes[0..4].copy_from_slice(b"ZIP!");
        let err = Header::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, PackageError::InvalidMagic { .. }));
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.to_string().contains("Magic mismatch"));
    }

    #[test]
    fn test_short_foreign_file_reports_magic() {
        let err = Header::from_bytes(b"PK\x03\x04").unwrap_err();
        assert!(matches!(err, PackageError::InvalidMagic { .. }));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = Header::new().to_bytes();
        let err = Header::from_bytes(&bytes[..60]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_invalid_version() {
        let mut header = Header::new();
        header.format_version = 99;
        let err = Header::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(matches!(err, PackageError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_reserved_field_rejected() {
        let mut header = Header::new();
        header.reserved = 1;
        let err = Header::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(matches!(
            err,
            PackageError::ReservedNotZero {
                field: "Reserved",
                ..
            }
        ));
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let mut header = Header::new();
        header.flags = 1 << 20;
        let err = Header::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(matches!(
            err,
            PackageError::ReservedNotZero { field: "Flags", .. }
        ));
    }

    #[test]
    fn test_invalid_compression_code() {
        let mut header = Header::new();
        header.flags = 0x0000_0900;
        let err = Header::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(matches!(err, PackageError::InvalidCompressionType(9)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_feature_flags() {
        let mut header = Header::new();
        header.set_compression_type(CompressionType::Lzma);
        header.set_feature(FLAG_METADATA_ONLY, true);
        header.set_feature(FLAG_HAS_SPECIAL_METADATA, true);
        assert!(header.has_feature(FLAG_METADATA_ONLY));
        assert_eq!(header.features(), 0xC0);

        header.set_feature(FLAG_METADATA_ONLY, false);
        assert!(!header.has_feature(FLAG_METADATA_ONLY));
        // Compression bits untouched by feature edits
        assert_eq!(header.compression_type().unwrap(), CompressionType::Lzma);
    }

    #[test]
    fn test_bounds_validation() {
        let header = sample_header();
        assert!(header.validate_bounds(1000).is_ok());

        let err = header.validate_bounds(540).unwrap_err();
        assert!(matches!(
            err,
            PackageError::OutOfBounds {
                field: "IndexStart",
                ..
            }
        ));

        let mut header = sample_header();
        header.comment_start = u64::MAX;
        assert!(matches!(
            header.validate_bounds(1000),
            Err(PackageError::OutOfBounds {
                field: "CommentStart",
                ..
            })
        ));
    }

    #[test]
    fn test_comment_fields_must_agree() {
        let mut header = Header::new();
        header.comment_size = 10;
        assert!(header.validate().is_err());
    }
}
