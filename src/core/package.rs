//! Package model: lifecycle, lookup, metadata and the signature chain
//!
//! A [`Package`] is created in memory with [`Package::new`] or loaded with
//! [`Package::open`]. Content operations live in `pipeline.rs`, persistence
//! in `writer.rs`.

use crate::buffer_pool::BufferPool;
use crate::classify::{FileClassifier, FileTypeTag, NullClassifier};
use crate::comment::{decode_comment, encode_comment};
use crate::compression::{CompressionType, ContentProfile, StreamingCompressor};
use crate::config::PackageConfig;
use crate::context::Context;
use crate::dedup::{ContentDigest, DedupEngine, DedupStage, DedupStats, StageVariant};
use crate::encryption::{EncryptionType, KeyProvider};
use crate::entry::{FileEntry, HashPurpose, HashType, OptionalDataType, FILE_ENTRY_FIXED_SIZE};
use crate::error::{PackageError, Result};
use crate::header::{
    Header, FLAG_HAS_COMPRESSED_FILES, FLAG_HAS_ENCRYPTED_FILES, FLAG_HAS_EXTENDED_ATTRS,
    FLAG_HAS_PACKAGE_COMMENT, FLAG_HAS_PER_FILE_TAGS, FLAG_HAS_SPECIAL_METADATA,
    FLAG_METADATA_ONLY, HEADER_SIZE, INDEX_SIZE_INCOMPLETE,
};
use crate::index::{FileIndex, INDEX_FIXED_SIZE, INDEX_RECORD_SIZE};
use crate::io::PackageFile;
use crate::path_metadata::{is_special_file_type, PathMetadataEntry};
use crate::signature::{
    KeyRing, SignatureBlock, SignatureChain, SignatureReport, SignatureStatus, SignatureType,
    Signer, Verifier,
};
use crate::validation::normalize_path;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an entry's stored bytes currently live
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataSource {
    /// Held in memory until the next write
    Memory(Vec<u8>),
    /// At this offset in the backing file
    Disk { offset: u64 },
    /// Content reference, no data block
    Reference,
}

#[derive(Debug, Clone)]
pub(crate) struct EntrySlot {
    pub(crate) entry: FileEntry,
    pub(crate) data: DataSource,
    /// Offset of this entry's record in the backing file, while the record
    /// there still matches `entry`
    pub(crate) on_disk: Option<u64>,
}

/// The file a package was loaded from or last written to
pub(crate) struct Backing {
    pub(crate) file: Mutex<PackageFile>,
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
    /// Header as it is on disk
    pub(crate) header: Header,
}

/// Summary of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub file_count: usize,
    /// Entries holding their own data block
    pub stored_count: usize,
    pub total_original_size: u64,
    pub total_stored_size: u64,
    pub compression: CompressionType,
    pub features: u8,
    pub signature_count: usize,
    pub comment_len: usize,
    pub package_data_version: u32,
    pub metadata_version: u32,
    pub created_time: i64,
    pub modified_time: i64,
    pub dedup: DedupStats,
}

pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// In-memory package
///
/// A package is single-writer: mutation takes `&mut self`. Reads take `&self`
/// and share the backing file handle through a mutex.
pub struct Package {
    pub(crate) config: PackageConfig,
    pub(crate) header: Header,
    pub(crate) slots: Vec<EntrySlot>,
    pub(crate) comment: Option<String>,
    /// Mirror of the path metadata file
    pub(crate) path_metadata: Vec<PathMetadataEntry>,
    pub(crate) signatures: Option<SignatureChain>,
    pub(crate) backing: Option<Backing>,
    pub(crate) read_only: bool,
    /// `None` once FileID `u64::MAX` is in use
    pub(crate) next_file_id: Option<u64>,
    pub(crate) dedup: DedupEngine,
    pub(crate) compressor: StreamingCompressor,
    pub(crate) keys: KeyProvider,
    pub(crate) classifier: Arc<dyn FileClassifier>,
    pub(crate) context: Context,
}

impl Default for Package {
    fn default() -> Self {
        Package::new()
    }
}

impl Package {
    /// Create an empty in-memory package (no I/O)
    pub fn new() -> Self {
        Package::build(PackageConfig::default())
    }

    /// Create an empty in-memory package with a validated configuration
    pub fn with_config(config: PackageConfig) -> Result<Self> {
        config.check()?;
        Ok(Package::build(config))
    }

    fn build(config: PackageConfig) -> Self {
        let pool = BufferPool::new(config.buffer_pool.clone());
        let compressor = StreamingCompressor::new(config.streaming.clone(), pool);
        let mut header = Header::new();
        let now = now_nanos();
        header.created_time = now;
        header.modified_time = now;
        if let Some(compression) = config.compression.default_type.resolve() {
            header.set_compression_type(compression);
        }
        Package {
            config,
            header,
            slots: Vec::new(),
            comment: None,
            path_metadata: Vec::new(),
            signatures: None,
            backing: None,
            read_only: false,
            next_file_id: Some(1),
            dedup: DedupEngine::new(),
            compressor,
            keys: KeyProvider::new(),
            classifier: Arc::new(NullClassifier),
            context: Context::new(),
        }
    }

    /// Open an existing package for reading and writing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, PackageConfig::default(), false)
    }

    /// Open an existing package; every mutation will be rejected
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, PackageConfig::default(), true)
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: PackageConfig,
        read_only: bool,
    ) -> Result<Self> {
        config.check()?;
        let (package, _) = Self::load(path.as_ref(), config, read_only, false)?;
        Ok(package)
    }

    /// Load `path`; with `recover` set, an interrupted in-place write is
    /// tolerated by falling back to the index that preceded it
    ///
    /// Returns the package and whether such a write was found.
    pub(crate) fn load(
        path: &Path,
        config: PackageConfig,
        read_only: bool,
        recover: bool,
    ) -> Result<(Self, bool)> {
        let mut package = Package::build(config);
        package.read_only = read_only;
        let ctx = package.context.clone();

        let mut file = PackageFile::open(path, !read_only)?;
        let len = file.len()?;
        let mut header = file.read_header()?;

        let incomplete = header.index_size == INDEX_SIZE_INCOMPLETE;
        if incomplete {
            if !recover {
                return Err(PackageError::IncompleteWrite);
            }
            // The marker keeps IndexStart pointing at the previous index
            let count_bytes = file.read_at(header.index_start, 4)?;
            let count =
                u32::from_le_bytes([count_bytes[0], count_bytes[1], count_bytes[2], count_bytes[3]]);
            header.index_size = (count as u64)
                .checked_mul(INDEX_RECORD_SIZE as u64)
                .and_then(|records| records.checked_add(INDEX_FIXED_SIZE as u64))
                .ok_or_else(|| {
                    PackageError::malformed("FileIndex", "EntryCount", "entry count overflows")
                })?;
            header.validate_bounds(len)?;
            warn!(path = %path.display(), "Recovering from an interrupted in-place write");
        }

        let index_bytes = file.read_at(header.index_start, header.index_size as usize)?;
        let index = FileIndex::decode(&index_bytes, header.index_start)?;

        let comment = if header.has_comment() {
            let bytes = file.read_at(header.comment_start, header.comment_size as usize)?;
            Some(decode_comment(&bytes)?)
        } else {
            None
        };

        if header.package_crc != 0 {
            let actual = file.crc32_range(
                HEADER_SIZE as u64,
                header.crc_range_end(),
                package.compressor.pool(),
                &ctx,
            )?;
            if actual != header.package_crc {
                return Err(PackageError::ChecksumMismatch {
                    what: "package".to_string(),
                    expected: header.package_crc,
                    actual,
                });
            }
        }

        let records = index.entries();
        let mut slots = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            ctx.check("open")?;
            let limit = records
                .get(i + 1)
                .map(|next| next.offset)
                .unwrap_or(header.index_start);
            let slot = read_slot(&mut file, record.file_id, record.offset, limit)?;
            slots.push(slot);
        }

        let signatures = if header.is_signed() {
            let mapped = file.map()?;
            Some(SignatureChain::from_package_bytes(
                &mapped,
                header.signature_offset,
            )?)
        } else {
            None
        };

        package.next_file_id = match slots.iter().map(|s| s.entry.file_id).max() {
            Some(max) => max.checked_add(1),
            None => Some(1),
        };
        package.comment = comment;
        package.signatures = signatures;
        package.slots = slots;
        package.header = header;
        package.verify_references()?;
        package.rebuild_dedup();

        let canonical = std::fs::canonicalize(path)
            .map_err(|e| PackageError::io_at("canonicalize", path, None, e))?;
        package.backing = Some(Backing {
            file: Mutex::new(file),
            path: canonical,
            len,
            header,
        });
        package.path_metadata = package.read_path_metadata_file()?;

        info!(
            path = %path.display(),
            files = package.slots.len(),
            signatures = package.signature_count(),
            read_only,
            "Opened package"
        );
        Ok((package, incomplete))
    }

    /// Every content reference must point at an entry holding a data block
    fn verify_references(&self) -> Result<()> {
        for slot in &self.slots {
            if let Some(canonical) = slot.entry.content_reference() {
                let target = self.slot(canonical).ok_or_else(|| {
                    PackageError::InconsistentIndex(format!(
                        "file {} references missing file {}",
                        slot.entry.file_id, canonical
                    ))
                })?;
                if target.entry.content_reference().is_some() {
                    return Err(PackageError::InconsistentIndex(format!(
                        "file {} references file {}, which is itself a reference",
                        slot.entry.file_id, canonical
                    )));
                }
            }
        }
        Ok(())
    }

    /// Seed the raw dedup stage from the hashes stored with canonical entries
    ///
    /// Processed and final stage digests are not persisted, so those stages
    /// start empty for a loaded package.
    pub(crate) fn rebuild_dedup(&mut self) {
        self.dedup.clear();
        if !self.config.dedup.raw {
            return;
        }
        for slot in &self.slots {
            if slot.entry.content_reference().is_some() {
                continue;
            }
            if let Some(digest) = stored_raw_digest(&slot.entry) {
                self.dedup.claim_or_join(
                    DedupStage::Raw,
                    StageVariant::raw(slot.entry.encryption),
                    &digest,
                    slot.entry.file_id,
                );
            }
        }
        debug!(
            canonical = self.dedup.canonical_count(DedupStage::Raw),
            "Rebuilt raw dedup stage"
        );
    }

    /// Release in-memory state and the backing file handle
    pub fn close(mut self) {
        if self.backing.is_none() && !self.slots.is_empty() {
            warn!(
                files = self.slots.len(),
                "Closing a package that was never written"
            );
        }
        self.slots.clear();
        self.signatures = None;
        self.comment = None;
        self.path_metadata.clear();
        self.dedup.clear();
        self.backing = None;
        debug!("Closed package");
    }

    // ---- state ----

    pub fn config(&self) -> &PackageConfig {
        &self.config
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_signed(&self) -> bool {
        self.signatures.is_some()
    }

    /// Path of the backing file, if the package was loaded or written
    pub fn path(&self) -> Option<&Path> {
        self.backing.as_ref().map(|b| b.path.as_path())
    }

    pub fn set_key_provider(&mut self, keys: KeyProvider) {
        self.keys = keys;
    }

    pub fn key_provider(&self) -> &KeyProvider {
        &self.keys
    }

    pub fn set_classifier(&mut self, classifier: Arc<dyn FileClassifier>) {
        self.classifier = classifier;
    }

    /// Context observed by every long-running operation on this package
    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(PackageError::ReadOnly);
        }
        Ok(())
    }

    /// Content and metadata are frozen while signatures are present
    pub(crate) fn ensure_mutable(&self) -> Result<()> {
        self.ensure_writable()?;
        if self.signatures.is_some() {
            return Err(PackageError::SignedPackage);
        }
        Ok(())
    }

    pub(crate) fn touch_content(&mut self) {
        self.header.package_data_version = self.header.package_data_version.wrapping_add(1);
        self.refresh_flags();
    }

    pub(crate) fn touch_metadata(&mut self) {
        self.header.metadata_version = self.header.metadata_version.wrapping_add(1);
        self.refresh_flags();
    }

    /// Recompute the feature flags that follow from entries, path metadata
    /// and comment
    pub(crate) fn refresh_flags(&mut self) {
        let compressed = self
            .slots
            .iter()
            .any(|s| s.entry.compression != CompressionType::None);
        let encrypted = self
            .slots
            .iter()
            .any(|s| s.entry.encryption != EncryptionType::None);
        let tagged = self
            .slots
            .iter()
            .any(|s| s.entry.optional(OptionalDataType::Tags).is_some())
            || self.path_metadata.iter().any(|e| !e.properties.is_empty());
        let extended_attrs = self
            .slots
            .iter()
            .any(|s| s.entry.optional(OptionalDataType::ExtendedAttributes).is_some())
            || self
                .path_metadata
                .iter()
                .any(|e| !e.filesystem.extended_attrs.is_empty());
        let special = self
            .slots
            .iter()
            .filter(|s| is_special_file_type(s.entry.file_type))
            .count();
        self.header
            .set_feature(FLAG_HAS_COMPRESSED_FILES, compressed);
        self.header.set_feature(FLAG_HAS_ENCRYPTED_FILES, encrypted);
        self.header.set_feature(FLAG_HAS_PER_FILE_TAGS, tagged);
        self.header.set_feature(FLAG_HAS_EXTENDED_ATTRS, extended_attrs);
        self.header.set_feature(FLAG_HAS_SPECIAL_METADATA, special > 0);
        self.header
            .set_feature(FLAG_METADATA_ONLY, special > 0 && special == self.slots.len());
        self.header
            .set_feature(FLAG_HAS_PACKAGE_COMMENT, self.comment.is_some());
    }

    // ---- lookup ----

    pub(crate) fn slot(&self, file_id: u64) -> Option<&EntrySlot> {
        self.slots.iter().find(|s| s.entry.file_id == file_id)
    }

    pub(crate) fn slot_mut(&mut self, file_id: u64) -> Result<&mut EntrySlot> {
        self.slots
            .iter_mut()
            .find(|s| s.entry.file_id == file_id)
            .ok_or_else(|| PackageError::FileNotFound(format!("file id {}", file_id)))
    }

    pub fn file_by_id(&self, file_id: u64) -> Option<&FileEntry> {
        self.slot(file_id).map(|s| &s.entry)
    }

    /// Look up an entry by any of its paths
    pub fn file_by_path(&self, path: &str) -> Option<&FileEntry> {
        let path = normalize_path(path).ok()?;
        self.slots
            .iter()
            .find(|s| s.entry.has_path(&path))
            .map(|s| &s.entry)
    }

    /// Entries in file order
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.slots.iter().map(|s| &s.entry)
    }

    pub fn file_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of entries whose content is a reference to `file_id`
    pub fn reference_count(&self, file_id: u64) -> usize {
        self.slots
            .iter()
            .filter(|s| s.entry.content_reference() == Some(file_id))
            .count()
    }

    pub(crate) fn content_profile(&self) -> ContentProfile {
        ContentProfile::from_files(self.slots.iter().map(|s| {
            (
                s.entry.original_size,
                FileTypeTag::from_u16(s.entry.file_type),
            )
        }))
    }

    pub fn info(&self) -> PackageInfo {
        let stored: Vec<&EntrySlot> = self
            .slots
            .iter()
            .filter(|s| s.entry.content_reference().is_none())
            .collect();
        PackageInfo {
            file_count: self.slots.len(),
            stored_count: stored.len(),
            total_original_size: self.slots.iter().map(|s| s.entry.original_size).sum(),
            total_stored_size: stored.iter().map(|s| s.entry.stored_size).sum(),
            compression: self
                .header
                .compression_type()
                .unwrap_or(CompressionType::None),
            features: self.header.features(),
            signature_count: self.signature_count(),
            comment_len: self.comment.as_ref().map_or(0, String::len),
            package_data_version: self.header.package_data_version,
            metadata_version: self.header.metadata_version,
            created_time: self.header.created_time,
            modified_time: self.header.modified_time,
            dedup: self.dedup.stats(),
        }
    }

    // ---- package metadata ----

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_comment(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        let text = text.into();
        encode_comment(&text)?;
        self.comment = Some(text);
        self.touch_metadata();
        Ok(())
    }

    pub fn clear_comment(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        if self.comment.take().is_some() {
            self.touch_metadata();
        }
        Ok(())
    }

    pub fn set_vendor_id(&mut self, vendor_id: u32) -> Result<()> {
        self.ensure_mutable()?;
        self.header.vendor_id = vendor_id;
        self.touch_metadata();
        Ok(())
    }

    pub fn set_app_id(&mut self, app_id: u64) -> Result<()> {
        self.ensure_mutable()?;
        self.header.app_id = app_id;
        self.touch_metadata();
        Ok(())
    }

    pub fn set_creator_id(&mut self, creator_id: u32) -> Result<()> {
        self.ensure_mutable()?;
        self.header.creator_id = creator_id;
        self.touch_metadata();
        Ok(())
    }

    pub fn set_locale_id(&mut self, locale_id: u32) -> Result<()> {
        self.ensure_mutable()?;
        self.header.locale_id = locale_id;
        self.touch_metadata();
        Ok(())
    }

    pub fn set_archive_chain_id(&mut self, chain_id: u64) -> Result<()> {
        self.ensure_mutable()?;
        self.header.archive_chain_id = chain_id;
        self.touch_metadata();
        Ok(())
    }

    /// Position of this package in a multi-part archive (1-based)
    pub fn set_archive_part_info(&mut self, part: u16, total: u16) -> Result<()> {
        self.ensure_mutable()?;
        if part == 0 || part > total {
            return Err(PackageError::invalid(
                "archive_part_info",
                format!("part {} of {} is out of range", part, total),
            ));
        }
        self.header.set_archive_part_info(part, total);
        self.touch_metadata();
        Ok(())
    }

    // ---- signatures ----

    pub fn signature_count(&self) -> usize {
        self.signatures.as_ref().map_or(0, SignatureChain::len)
    }

    pub fn signatures(&self) -> &[SignatureBlock] {
        self.signatures
            .as_ref()
            .map_or(&[], |chain| chain.blocks())
    }

    fn chain(&self, index: usize) -> Result<&SignatureChain> {
        self.signatures
            .as_ref()
            .ok_or(PackageError::SignatureNotFound { index, count: 0 })
    }

    /// Append a signature over everything currently in the package
    ///
    /// The first signature freezes the serialized package; later ones also
    /// cover every earlier block. Returns the new block's index.
    pub fn sign(&mut self, signer: &dyn Signer, comment: &str) -> Result<usize> {
        self.ensure_writable()?;
        self.context.check("sign")?;
        let mut chain = match self.signatures.take() {
            Some(chain) => chain,
            None => SignatureChain::seal(self.seal_prefix()?)?,
        };
        let result = chain.append(signer, comment);
        if !chain.is_empty() {
            self.signatures = Some(chain);
        }
        result
    }

    /// Remove signature `index` and every signature after it
    pub fn remove_signature(&mut self, index: usize) -> Result<()> {
        self.ensure_writable()?;
        let chain = self
            .signatures
            .as_mut()
            .ok_or(PackageError::SignatureNotFound { index, count: 0 })?;
        chain.truncate(index)?;
        if chain.is_empty() {
            self.signatures = None;
            info!("Package is no longer signed");
        }
        Ok(())
    }

    /// Drop every signature so the package can be modified again
    pub fn clear_signatures(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if let Some(chain) = self.signatures.take() {
            info!(removed = chain.len(), "Cleared signatures");
        }
        Ok(())
    }

    pub fn validate_all_signatures(&self, keyring: &KeyRing) -> Result<Vec<SignatureReport>> {
        match &self.signatures {
            Some(chain) => chain.validate_all(keyring),
            None => Ok(Vec::new()),
        }
    }

    pub fn validate_signature_index(
        &self,
        index: usize,
        keyring: &KeyRing,
    ) -> Result<SignatureStatus> {
        self.chain(index)?.validate_index(index, keyring)
    }

    pub fn validate_signature_type(
        &self,
        signature_type: SignatureType,
        keyring: &KeyRing,
    ) -> Result<Vec<SignatureReport>> {
        match &self.signatures {
            Some(chain) => chain.validate_type(signature_type, keyring),
            None => Ok(Vec::new()),
        }
    }

    pub fn validate_signature_with_key(
        &self,
        index: usize,
        verifier: &dyn Verifier,
    ) -> Result<SignatureStatus> {
        self.chain(index)?.validate_with_key(index, verifier)
    }
}

/// Raw-content digest recorded in an entry's hash records
pub(crate) fn stored_raw_digest(entry: &FileEntry) -> Option<ContentDigest> {
    let strong = entry.hash_for(HashType::Sha256, HashPurpose::Deduplication)?;
    let fast = entry.hash_for(HashType::Xxh3, HashPurpose::FastLookup)?;
    let strong: [u8; 32] = strong.try_into().ok()?;
    let fast: [u8; 8] = fast.try_into().ok()?;
    Some(ContentDigest {
        fast: u64::from_le_bytes(fast),
        strong,
    })
}

/// Parse the entry at `offset`, which must end (with its data) by `limit`
fn read_slot(file: &mut PackageFile, file_id: u64, offset: u64, limit: u64) -> Result<EntrySlot> {
    let room = limit.saturating_sub(offset);
    if room < FILE_ENTRY_FIXED_SIZE as u64 {
        return Err(PackageError::OutOfBounds {
            structure: "FileIndex",
            field: "Offset",
            offset,
            length: FILE_ENTRY_FIXED_SIZE as u64,
            limit,
        });
    }
    let prefix = file.read_at(offset, FILE_ENTRY_FIXED_SIZE)?;
    let record_len = FileEntry::record_len(&prefix)? as u64;
    if record_len > room {
        return Err(PackageError::OutOfBounds {
            structure: "FileEntry",
            field: "OptionalDataOffset",
            offset,
            length: record_len,
            limit,
        });
    }
    let bytes = file.read_at(offset, record_len as usize)?;
    let (entry, used) = FileEntry::decode(&bytes)?;
    if entry.file_id != file_id {
        return Err(PackageError::InconsistentIndex(format!(
            "index maps file {} to offset {}, which holds file {}",
            file_id, offset, entry.file_id
        )));
    }
    let data_offset = offset + used as u64;
    let data_len = entry.data_block_len();
    if data_offset.checked_add(data_len).map_or(true, |end| end > limit) {
        return Err(PackageError::OutOfBounds {
            structure: "FileEntry",
            field: "StoredSize",
            offset: data_offset,
            length: data_len,
            limit,
        });
    }
    let data = if entry.content_reference().is_some() {
        DataSource::Reference
    } else {
        DataSource::Disk {
            offset: data_offset,
        }
    };
    debug!(file_id, offset, data_len, "Loaded entry");
    Ok(EntrySlot {
        entry,
        data,
        on_disk: Some(offset),
    })
}
