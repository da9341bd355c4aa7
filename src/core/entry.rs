//! FileEntry records: 64-byte fixed prefix plus a variable tail
//!
//! **Tail layout** (offsets relative to the start of the tail):
//! - `[0, HashDataOffset)`: `PathCount` path records
//! - `[HashDataOffset, HashDataOffset + HashDataLen)`: `HashCount` hash records
//! - `[OptionalDataOffset, OptionalDataOffset + OptionalDataLen)`: optional data
//!
//! The tail ends at `OptionalDataOffset + OptionalDataLen`. The entry's data
//! block (`StoredSize` bytes) follows the tail, except for content-reference
//! entries which borrow the data block of another entry.

use crate::codec::FieldReader;
use crate::compression::CompressionType;
use crate::encryption::EncryptionType;
use crate::error::{PackageError, Result};
use crate::validation;

pub const FILE_ENTRY_FIXED_SIZE: usize = 64;

const PATH_RECORD_FIXED: usize = 2 + 4 + 4 + 4 + 8 + 8 + 8;
const HASH_RECORD_FIXED: usize = 4;
const OPTIONAL_RECORD_FIXED: usize = 3;

/// One path under which an entry's content is visible
///
/// Several paths may alias the same content; each keeps its own
/// permissions and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub path: String,
    pub mode: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub mod_time: u64,
    pub create_time: u64,
    pub access_time: u64,
}

impl PathEntry {
    pub fn new(path: impl Into<String>) -> Self {
        PathEntry {
            path: path.into(),
            mode: 0o644,
            user_id: 0,
            group_id: 0,
            mod_time: 0,
            create_time: 0,
            access_time: 0,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_times(mut self, mod_time: u64, create_time: u64, access_time: u64) -> Self {
        self.mod_time = mod_time;
        self.create_time = create_time;
        self.access_time = access_time;
        self
    }

    pub fn encoded_size(&self) -> usize {
        PATH_RECORD_FIXED + self.path.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let len = u16::try_from(self.path.len())
            .map_err(|_| PackageError::invalid("PathEntry.Path", "path longer than 65535 bytes"))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.user_id.to_le_bytes());
        out.extend_from_slice(&self.group_id.to_le_bytes());
        out.extend_from_slice(&self.mod_time.to_le_bytes());
        out.extend_from_slice(&self.create_time.to_le_bytes());
        out.extend_from_slice(&self.access_time.to_le_bytes());
        Ok(())
    }

    fn decode(r: &mut FieldReader<'_>) -> Result<Self> {
        let len = r.u16("PathLength")? as usize;
        let raw = r.bytes(len, "Path")?;
        let path = std::str::from_utf8(raw)
            .map_err(|_| PackageError::malformed("PathEntry", "Path", "path is not valid UTF-8"))?
            .to_string();
        if path.is_empty() {
            return Err(PackageError::malformed(
                "PathEntry",
                "Path",
                "path cannot be empty",
            ));
        }
        Ok(PathEntry {
            path,
            mode: r.u32("Mode")?,
            user_id: r.u32("UserID")?,
            group_id: r.u32("GroupID")?,
            mod_time: r.u64("ModTime")?,
            create_time: r.u64("CreateTime")?,
            access_time: r.u64("AccessTime")?,
        })
    }
}

/// Hash algorithm of a [`HashEntry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashType {
    Sha256 = 0x00,
    Sha512 = 0x01,
    Blake3 = 0x02,
    Xxh3 = 0x03,
    Blake2b = 0x04,
    Blake2s = 0x05,
    Sha3_256 = 0x06,
    Sha3_512 = 0x07,
    Crc32 = 0x08,
    Crc64 = 0x09,
}

impl HashType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(HashType::Sha256),
            0x01 => Some(HashType::Sha512),
            0x02 => Some(HashType::Blake3),
            0x03 => Some(HashType::Xxh3),
            0x04 => Some(HashType::Blake2b),
            0x05 => Some(HashType::Blake2s),
            0x06 => Some(HashType::Sha3_256),
            0x07 => Some(HashType::Sha3_512),
            0x08 => Some(HashType::Crc32),
            0x09 => Some(HashType::Crc64),
            _ => None,
        }
    }

    /// Digest length in bytes
    pub fn digest_len(self) -> usize {
        match self {
            HashType::Sha256 | HashType::Blake3 | HashType::Blake2s | HashType::Sha3_256 => 32,
            HashType::Sha512 | HashType::Blake2b | HashType::Sha3_512 => 64,
            HashType::Xxh3 | HashType::Crc64 => 8,
            HashType::Crc32 => 4,
        }
    }
}

/// Why a hash was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashPurpose {
    ContentVerification = 0x00,
    Deduplication = 0x01,
    Integrity = 0x02,
    FastLookup = 0x03,
    ErrorDetection = 0x04,
}

impl HashPurpose {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(HashPurpose::ContentVerification),
            0x01 => Some(HashPurpose::Deduplication),
            0x02 => Some(HashPurpose::Integrity),
            0x03 => Some(HashPurpose::FastLookup),
            0x04 => Some(HashPurpose::ErrorDetection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub hash_type: HashType,
    pub purpose: HashPurpose,
    pub digest: Vec<u8>,
}

impl HashEntry {
    pub fn new(hash_type: HashType, purpose: HashPurpose, digest: Vec<u8>) -> Self {
        HashEntry {
            hash_type,
            purpose,
            digest,
        }
    }

    pub fn encoded_size(&self) -> usize {
        HASH_RECORD_FIXED + self.digest.len()
    }

    fn validate(&self) -> Result<()> {
        if self.digest.len() != self.hash_type.digest_len() {
            return Err(PackageError::malformed(
                "HashEntry",
                "HashLength",
                format!(
                    "{:?} digest must be {} bytes, got {}",
                    self.hash_type,
                    self.hash_type.digest_len(),
                    self.digest.len()
                ),
            ));
        }
        Ok(())
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        out.push(self.hash_type as u8);
        out.push(self.purpose as u8);
        out.extend_from_slice(&(self.digest.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.digest);
        Ok(())
    }

    fn decode(r: &mut FieldReader<'_>) -> Result<Self> {
        let type_code = r.u8("HashType")?;
        let hash_type = HashType::from_u8(type_code).ok_or_else(|| {
            PackageError::invalid("HashEntry.HashType", format!("unknown code {}", type_code))
        })?;
        let purpose_code = r.u8("HashPurpose")?;
        let purpose = HashPurpose::from_u8(purpose_code).ok_or_else(|| {
            PackageError::invalid(
                "HashEntry.HashPurpose",
                format!("unknown code {}", purpose_code),
            )
        })?;
        let len = r.u16("HashLength")? as usize;
        let digest = r.bytes(len, "HashData")?.to_vec();
        let entry = HashEntry {
            hash_type,
            purpose,
            digest,
        };
        entry.validate()?;
        Ok(entry)
    }
}

/// Type of an optional-data record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionalDataType {
    Tags = 0x00,
    PathEncoding = 0x01,
    PathFlags = 0x02,
    CompressionDictionary = 0x03,
    SolidGroupId = 0x04,
    FileSystemFlags = 0x05,
    WindowsAttributes = 0x06,
    ExtendedAttributes = 0x07,
    Acl = 0x08,
    /// FileID (u64) of the entry whose data block holds this entry's content
    ContentReference = 0x09,
}

impl OptionalDataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(OptionalDataType::Tags),
            0x01 => Some(OptionalDataType::PathEncoding),
            0x02 => Some(OptionalDataType::PathFlags),
            0x03 => Some(OptionalDataType::CompressionDictionary),
            0x04 => Some(OptionalDataType::SolidGroupId),
            0x05 => Some(OptionalDataType::FileSystemFlags),
            0x06 => Some(OptionalDataType::WindowsAttributes),
            0x07 => Some(OptionalDataType::ExtendedAttributes),
            0x08 => Some(OptionalDataType::Acl),
            0x09 => Some(OptionalDataType::ContentReference),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalDataEntry {
    pub data_type: OptionalDataType,
    pub data: Vec<u8>,
}

impl OptionalDataEntry {
    pub fn new(data_type: OptionalDataType, data: Vec<u8>) -> Self {
        OptionalDataEntry { data_type, data }
    }

    pub fn encoded_size(&self) -> usize {
        OPTIONAL_RECORD_FIXED + self.data.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let len = u16::try_from(self.data.len()).map_err(|_| {
            PackageError::invalid("OptionalData.DataLength", "record longer than 65535 bytes")
        })?;
        out.push(self.data_type as u8);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.data);
        Ok(())
    }

    fn decode(r: &mut FieldReader<'_>) -> Result<Self> {
        let code = r.u8("DataType")?;
        let data_type = OptionalDataType::from_u8(code).ok_or_else(|| {
            PackageError::invalid("OptionalData.DataType", format!("unknown code {}", code))
        })?;
        let len = r.u16("DataLength")? as usize;
        let data = r.bytes(len, "Data")?.to_vec();
        if data_type == OptionalDataType::ContentReference && data.len() != 8 {
            return Err(PackageError::malformed(
                "OptionalData",
                "ContentReference",
                format!("reference must be 8 bytes, got {}", data.len()),
            ));
        }
        Ok(OptionalDataEntry { data_type, data })
    }
}

/// Offsets derived from the tail records at encode time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailLayout {
    pub hash_data_offset: u32,
    pub hash_data_len: u16,
    pub optional_data_offset: u32,
    pub optional_data_len: u16,
}

impl TailLayout {
    pub fn tail_len(&self) -> usize {
        self.optional_data_offset as usize + self.optional_data_len as usize
    }
}

/// Metadata record for one stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Stable identity, never reused within a package
    pub file_id: u64,
    pub original_size: u64,
    pub stored_size: u64,
    /// CRC32 of the original content
    pub raw_checksum: u32,
    /// CRC32 of the stored bytes
    pub stored_checksum: u32,
    /// Bumped on content changes
    pub file_version: u32,
    /// Bumped on metadata-only changes
    pub metadata_version: u32,
    pub file_type: u16,
    pub compression: CompressionType,
    pub compression_level: u8,
    pub encryption: EncryptionType,
    pub paths: Vec<PathEntry>,
    pub hashes: Vec<HashEntry>,
    pub optional_data: Vec<OptionalDataEntry>,
}

impl FileEntry {
    pub fn new(file_id: u64) -> Self {
        FileEntry {
            file_id,
            original_size: 0,
            stored_size: 0,
            raw_checksum: 0,
            stored_checksum: 0,
            file_version: 1,
            metadata_version: 1,
            file_type: 0,
            compression: CompressionType::None,
            compression_level: 0,
            encryption: EncryptionType::None,
            paths: Vec::new(),
            hashes: Vec::new(),
            optional_data: Vec::new(),
        }
    }

    /// Primary path (the first path record)
    pub fn primary_path(&self) -> Option<&str> {
        self.paths.first().map(|p| p.path.as_str())
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p.path == path)
    }

    pub fn hash(&self, hash_type: HashType) -> Option<&[u8]> {
        self.hashes
            .iter()
            .find(|h| h.hash_type == hash_type)
            .map(|h| h.digest.as_slice())
    }

    pub fn hash_for(&self, hash_type: HashType, purpose: HashPurpose) -> Option<&[u8]> {
        self.hashes
            .iter()
            .find(|h| h.hash_type == hash_type && h.purpose == purpose)
            .map(|h| h.digest.as_slice())
    }

    pub fn optional(&self, data_type: OptionalDataType) -> Option<&[u8]> {
        self.optional_data
            .iter()
            .find(|o| o.data_type == data_type)
            .map(|o| o.data.as_slice())
    }

    /// Replace (or remove, with `None`) the optional record of one type
    pub fn set_optional(&mut self, data_type: OptionalDataType, data: Option<Vec<u8>>) {
        self.optional_data.retain(|o| o.data_type != data_type);
        if let Some(data) = data {
            self.optional_data.push(OptionalDataEntry::new(data_type, data));
        }
    }

    /// FileID of the canonical entry holding this entry's content, if deduplicated
    pub fn content_reference(&self) -> Option<u64> {
        self.optional(OptionalDataType::ContentReference).map(|d| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(d);
            u64::from_le_bytes(raw)
        })
    }

    pub fn set_content_reference(&mut self, canonical: Option<u64>) {
        self.set_optional(
            OptionalDataType::ContentReference,
            canonical.map(|id| id.to_le_bytes().to_vec()),
        );
    }

    /// Bytes of the data block that follows this entry on disk
    pub fn data_block_len(&self) -> u64 {
        if self.content_reference().is_some() {
            0
        } else {
            self.stored_size
        }
    }

    /// Compute the tail layout for the current records
    pub fn layout(&self) -> Result<TailLayout> {
        let path_bytes: usize = self.paths.iter().map(PathEntry::encoded_size).sum();
        let hash_bytes: usize = self.hashes.iter().map(HashEntry::encoded_size).sum();
        let optional_bytes: usize = self
            .optional_data
            .iter()
            .map(OptionalDataEntry::encoded_size)
            .sum();

        let hash_data_len = u16::try_from(hash_bytes)
            .map_err(|_| PackageError::invalid("FileEntry.HashDataLen", "hash records exceed 65535 bytes"))?;
        let optional_data_len = u16::try_from(optional_bytes).map_err(|_| {
            PackageError::invalid(
                "FileEntry.OptionalDataLen",
                "optional records exceed 65535 bytes",
            )
        })?;
        let hash_data_offset = u32::try_from(path_bytes)
            .map_err(|_| PackageError::invalid("FileEntry.HashDataOffset", "path records too large"))?;

        Ok(TailLayout {
            hash_data_offset,
            hash_data_len,
            optional_data_offset: hash_data_offset + hash_data_len as u32,
            optional_data_len,
        })
    }

    /// Encoded size of fixed prefix plus tail
    pub fn encoded_size(&self) -> Result<usize> {
        Ok(FILE_ENTRY_FIXED_SIZE + self.layout()?.tail_len())
    }

    /// Check record-level invariants before encoding
    pub fn validate(&self) -> Result<()> {
        if self.file_id == 0 {
            return Err(PackageError::invalid("FileEntry.FileID", "file ID cannot be zero"));
        }
        if self.paths.is_empty() {
            return Err(PackageError::invalid(
                "FileEntry.PathCount",
                "entry must have at least one path",
            ));
        }
        if self.paths.len() > u16::MAX as usize {
            return Err(PackageError::invalid("FileEntry.PathCount", "too many paths"));
        }
        if self.hashes.len() > u8::MAX as usize {
            return Err(PackageError::invalid("FileEntry.HashCount", "too many hashes"));
        }
        for path in &self.paths {
            validation::validate_stored_path(&path.path)?;
        }
        Ok(())
    }

    /// Serialize the fixed prefix and tail
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let layout = self.layout()?;

        let mut out = Vec::with_capacity(FILE_ENTRY_FIXED_SIZE + layout.tail_len());
        out.extend_from_slice(&self.file_id.to_le_bytes());
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.stored_size.to_le_bytes());
        out.extend_from_slice(&self.raw_checksum.to_le_bytes());
        out.extend_from_slice(&self.stored_checksum.to_le_bytes());
        out.extend_from_slice(&self.file_version.to_le_bytes());
        out.extend_from_slice(&self.metadata_version.to_le_bytes());
        out.extend_from_slice(&(self.paths.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.file_type.to_le_bytes());
        out.push(self.compression as u8);
        out.push(self.compression_level);
        out.push(self.encryption as u8);
        out.push(self.hashes.len() as u8);
        out.extend_from_slice(&layout.hash_data_offset.to_le_bytes());
        out.extend_from_slice(&layout.hash_data_len.to_le_bytes());
        out.extend_from_slice(&layout.optional_data_len.to_le_bytes());
        out.extend_from_slice(&layout.optional_data_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        debug_assert_eq!(out.len(), FILE_ENTRY_FIXED_SIZE);

        for path in &self.paths {
            path.encode_into(&mut out)?;
        }
        for hash in &self.hashes {
            hash.encode_into(&mut out)?;
        }
        for opt in &self.optional_data {
            opt.encode_into(&mut out)?;
        }

        Ok(out)
    }

    /// Length of the entry record (prefix plus tail) declared by a fixed prefix
    pub fn record_len(prefix: &[u8]) -> Result<usize> {
        let mut r = FieldReader::new(prefix, "FileEntry");
        r.skip(54, "OptionalDataLen")?;
        let optional_data_len = r.u16("OptionalDataLen")? as usize;
        let optional_data_offset = r.u32("OptionalDataOffset")? as usize;
        Ok(FILE_ENTRY_FIXED_SIZE + optional_data_offset + optional_data_len)
    }

    /// Decode an entry from `bytes`, which must start at the entry and may
    /// extend past it (up to the end of the region the entry may occupy).
    ///
    /// Returns the entry and the number of bytes its prefix and tail occupy.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = FieldReader::new(bytes, "FileEntry");

        let file_id = r.u64("FileID")?;
        let original_size = r.u64("OriginalSize")?;
        let stored_size = r.u64("StoredSize")?;
        let raw_checksum = r.u32("RawChecksum")?;
        let stored_checksum = r.u32("StoredChecksum")?;
        let file_version = r.u32("FileVersion")?;
        let metadata_version = r.u32("MetadataVersion")?;
        let path_count = r.u16("PathCount")?;
        let file_type = r.u16("Type")?;
        let compression_code = r.u8("CompressionType")?;
        let compression_level = r.u8("CompressionLevel")?;
        let encryption_code = r.u8("EncryptionType")?;
        let hash_count = r.u8("HashCount")?;
        let hash_data_offset = r.u32("HashDataOffset")? as u64;
        let hash_data_len = r.u16("HashDataLen")? as u64;
        let optional_data_len = r.u16("OptionalDataLen")? as u64;
        let optional_data_offset = r.u32("OptionalDataOffset")? as u64;
        let reserved = r.u32("Reserved")?;

        if file_id == 0 {
            return Err(PackageError::malformed(
                "FileEntry",
                "FileID",
                "file ID cannot be zero",
            ));
        }
        if reserved != 0 {
            return Err(PackageError::ReservedNotZero {
                structure: "FileEntry",
                field: "Reserved",
                value: reserved as u64,
            });
        }
        let compression = CompressionType::from_u8(compression_code)
            .ok_or(PackageError::InvalidCompressionType(compression_code))?;
        let encryption = EncryptionType::from_u8(encryption_code)
            .ok_or(PackageError::InvalidEncryptionType(encryption_code))?;

        // The optional region is last, so its end is the declared tail length
        let tail_len = optional_data_offset + optional_data_len;
        let available = r.remaining() as u64;
        if tail_len > available {
            return Err(PackageError::OutOfBounds {
                structure: "FileEntry",
                field: "OptionalDataOffset",
                offset: optional_data_offset,
                length: optional_data_len,
                limit: available,
            });
        }
        if hash_data_offset + hash_data_len > optional_data_offset {
            return Err(PackageError::OutOfBounds {
                structure: "FileEntry",
                field: "HashDataOffset",
                offset: hash_data_offset,
                length: hash_data_len,
                limit: optional_data_offset,
            });
        }

        let tail = r.bytes(tail_len as usize, "Tail")?;

        let path_region = &tail[..hash_data_offset as usize];
        let mut pr = FieldReader::new(path_region, "PathEntry");
        let mut paths = Vec::with_capacity(path_count as usize);
        for _ in 0..path_count {
            paths.push(PathEntry::decode(&mut pr)?);
        }
        if pr.remaining() != 0 {
            return Err(PackageError::malformed(
                "FileEntry",
                "HashDataOffset",
                format!(
                    "{} path records end at {}, hash data starts at {}",
                    path_count,
                    pr.position(),
                    hash_data_offset
                ),
            ));
        }

        let hash_end = (hash_data_offset + hash_data_len) as usize;
        let hash_region = &tail[hash_data_offset as usize..hash_end];
        let mut hr = FieldReader::new(hash_region, "HashEntry");
        let mut hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            hashes.push(HashEntry::decode(&mut hr)?);
        }
        if hr.remaining() != 0 {
            return Err(PackageError::malformed(
                "FileEntry",
                "HashDataLen",
                format!(
                    "{} hash records occupy {} of {} declared bytes",
                    hash_count,
                    hr.position(),
                    hash_data_len
                ),
            ));
        }

        let optional_region = &tail[optional_data_offset as usize..];
        let mut or = FieldReader::new(optional_region, "OptionalData");
        let mut optional_data = Vec::new();
        while or.remaining() > 0 {
            optional_data.push(OptionalDataEntry::decode(&mut or)?);
        }

        let entry = FileEntry {
            file_id,
            original_size,
            stored_size,
            raw_checksum,
            stored_checksum,
            file_version,
            metadata_version,
            file_type,
            compression,
            compression_level,
            encryption,
            paths,
            hashes,
            optional_data,
        };

        Ok((entry, FILE_ENTRY_FIXED_SIZE + tail_len as usize))
    }
}

/// Encode per-file tags for the `Tags` optional record
pub fn encode_tags(tags: &[(String, String)]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let count = u16::try_from(tags.len())
        .map_err(|_| PackageError::invalid("Tags", "too many tags"))?;
    out.extend_from_slice(&count.to_le_bytes());
    for (key, value) in tags {
        for part in [key, value] {
            let len = u16::try_from(part.len())
                .map_err(|_| PackageError::invalid("Tags", "tag too long"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(part.as_bytes());
        }
    }
    Ok(out)
}

pub fn decode_tags(data: &[u8]) -> Result<Vec<(String, String)>> {
    let mut r = FieldReader::new(data, "Tags");
    let count = r.u16("Count")?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut pair = [String::new(), String::new()];
        for slot in pair.iter_mut() {
            let len = r.u16("Length")? as usize;
            let raw = r.bytes(len, "Text")?;
            *slot = std::str::from_utf8(raw)
                .map_err(|_| PackageError::malformed("Tags", "Text", "tag is not valid UTF-8"))?
                .to_string();
        }
        let [key, value] = pair;
        tags.push((key, value));
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_entry() -> FileEntry {
        let mut entry = FileEntry::new(42);
        entry.original_size = 1024;
        entry.stored_size = 512;
        entry.raw_checksum = 0xAABB_CCDD;
        entry.stored_checksum = 0x1122_3344;
        entry.file_version = 3;
        entry.metadata_version = 5;
        entry.file_type = 7;
        entry.compression = CompressionType::Zstd;
        entry.compression_level = 3;
        entry.encryption = EncryptionType::Aes256Gcm;
        entry.paths.push(PathEntry::new("docs/readme.txt").with_mode(0o600));
        entry
            .paths
            .push(PathEntry::new("alias/readme.txt").with_times(1, 2, 3));
        entry.hashes.push(HashEntry::new(
            HashType::Sha256,
            HashPurpose::Deduplication,
            vec![0xAB; 32],
        ));
        entry.hashes.push(HashEntry::new(
            HashType::Xxh3,
            HashPurpose::FastLookup,
            vec![0x01; 8],
        ));
        entry.optional_data.push(OptionalDataEntry::new(
            OptionalDataType::Tags,
            encode_tags(&[("lang".into(), "en".into())]).unwrap(),
        ));
        entry
    }

    fn set_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = sample_entry();
        let bytes = entry.encode().unwrap();
        assert_eq!(bytes.len(), entry.encoded_size().unwrap());

        let (decoded, consumed) = FileEntry::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decode_ignores_trailing_data() {
        let entry = sample_entry();
        let mut bytes = entry.encode().unwrap();
        let len = bytes.len();
        bytes.extend_from_slice(b"file data follows");

        let (decoded, consumed) = FileEntry::decode(&bytes).unwrap();
        assert_eq!(consumed, len);
        assert_eq!(decoded.file_id, 42);
    }

    #[test]
    fn test_layout_offsets() {
        let entry = sample_entry();
        let layout = entry.layout().unwrap();
        let path_bytes = (38 + 15) + (38 + 16);
        assert_eq!(layout.hash_data_offset as usize, path_bytes);
        assert_eq!(layout.hash_data_len as usize, (4 + 32) + (4 + 8));
        assert_eq!(
            layout.optional_data_offset,
            layout.hash_data_offset + layout.hash_data_len as u32
        );
    }

    #[test]
    fn test_hash_offset_out_of_bounds() {
        let mut bytes = sample_entry().encode().unwrap();
        // HashDataLen pushed past the optional region
        set_u16(&mut bytes, 52, 0xFFFF);
        let err = FileEntry::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            PackageError::OutOfBounds {
                field: "HashDataOffset",
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_optional_offset_out_of_bounds() {
        let mut bytes = sample_entry().encode().unwrap();
        set_u32(&mut bytes, 56, 0x00FF_FFFF);
        let err = FileEntry::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            PackageError::OutOfBounds {
                field: "OptionalDataOffset",
                ..
            }
        ));
    }

    #[test]
    fn test_reserved_must_be_zero() {
        let mut bytes = sample_entry().encode().unwrap();
        set_u32(&mut bytes, 60, 1);
        let err = FileEntry::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            PackageError::ReservedNotZero {
                structure: "FileEntry",
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_invalid_type_codes() {
        let mut bytes = sample_entry().encode().unwrap();
        bytes[44] = 77;
        assert!(matches!(
            FileEntry::decode(&bytes),
            Err(PackageError::InvalidCompressionType(77))
        ));

        let mut bytes = sample_entry().encode().unwrap();
        bytes[46] = 9;
        assert!(matches!(
            FileEntry::decode(&bytes),
            Err(PackageError::InvalidEncryptionType(9))
        ));
    }

    #[test]
    fn test_zero_file_id_rejected() {
        let mut bytes = sample_entry().encode().unwrap();
        bytes[0..8].copy_from_slice(&0u64.to_le_bytes());
        assert!(FileEntry::decode(&bytes).is_err());

        let entry = FileEntry::new(0);
        assert!(entry.encode().is_err());
    }

    #[test]
    fn test_path_count_mismatch_detected() {
        let mut bytes = sample_entry().encode().unwrap();
        set_u16(&mut bytes, 40, 1);
        let err = FileEntry::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            PackageError::Malformed {
                field: "HashDataOffset",
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_tail() {
        let bytes = sample_entry().encode().unwrap();
        let err = FileEntry::decode(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, PackageError::OutOfBounds { .. }));
    }

    #[test]
    fn test_content_reference() {
        let mut entry = sample_entry();
        assert_eq!(entry.content_reference(), None);
        assert_eq!(entry.data_block_len(), 512);

        entry.set_content_reference(Some(7));
        assert_eq!(entry.content_reference(), Some(7));
        assert_eq!(entry.data_block_len(), 0);

        let bytes = entry.encode().unwrap();
        let (decoded, _) = FileEntry::decode(&bytes).unwrap();
        assert_eq!(decoded.content_reference(), Some(7));

        entry.set_content_reference(None);
        assert_eq!(entry.content_reference(), None);
    }

    #[test]
    fn test_hash_length_checked() {
        let mut entry = sample_entry();
        entry.hashes[0].digest.truncate(10);
        assert!(entry.encode().is_err());
    }

    #[test]
    fn test_tags_round_trip() {
        let tags = vec![
            ("lang".to_string(), "en".to_string()),
            ("kind".to_string(), "texture".to_string()),
        ];
        let encoded = encode_tags(&tags).unwrap();
        assert_eq!(decode_tags(&encoded).unwrap(), tags);
        assert!(decode_tags(&encoded[..3]).is_err());
    }

    #[test]
    fn test_record_len_from_prefix() {
        let entry = sample_entry();
        let bytes = entry.encode().unwrap();
        assert_eq!(
            FileEntry::record_len(&bytes[..FILE_ENTRY_FIXED_SIZE]).unwrap(),
            bytes.len()
        );
        assert!(FileEntry::record_len(&bytes[..40]).is_err());
    }
}
