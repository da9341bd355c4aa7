//! Content pipeline: dedup, compression and encryption of file payloads
//!
//! Content passes through three dedup checkpoints. Raw content is looked up
//! first, then the compressed bytes, then the bytes that will be stored. The
//! first hit turns the new entry into a reference to the canonical entry.
//! Nothing is registered with the dedup engine until the whole pipeline has
//! succeeded, so a failed or cancelled add leaves no dedup state behind.

use crate::classify::FileTypeTag;
use crate::compression::{select_compression, CompressionType};
use crate::config::CompressionChoice;
use crate::dedup::{Claim, ContentDigest, DedupStage, StageVariant};
use crate::encryption::EncryptionType;
use crate::entry::{
    decode_tags, encode_tags, FileEntry, HashEntry, HashPurpose, HashType, OptionalDataType,
    PathEntry,
};
use crate::error::{PackageError, Result};
use crate::package::{now_nanos, DataSource, EntrySlot, Package};
use crate::path_metadata::is_special_file_type;
use crate::validation::normalize_path;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Bytes handed to the classifier when no type is given
const CLASSIFY_SAMPLE_LEN: usize = 512;

/// Per-file choices for [`Package::add_file`]
#[derive(Debug, Clone, Default)]
pub struct AddFileOptions {
    /// `Unspecified` defers to the configuration, then the package, then
    /// automatic selection
    pub compression: CompressionChoice,
    /// Codec level; `None` uses the configured level
    pub level: Option<u8>,
    pub encryption: EncryptionType,
    /// Skips the classifier when set
    pub file_type: Option<FileTypeTag>,
    /// Permission bits for the path record (0o644 when unset)
    pub mode: Option<u32>,
    pub mod_time: u64,
    pub tags: Vec<(String, String)>,
}

impl AddFileOptions {
    pub fn new() -> Self {
        AddFileOptions::default()
    }

    pub fn compression(mut self, compression: CompressionChoice) -> Self {
        self.compression = compression;
        self
    }

    pub fn level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn encryption(mut self, encryption: EncryptionType) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn file_type(mut self, file_type: FileTypeTag) -> Self {
        self.file_type = Some(file_type);
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// Digests of one payload at each dedup checkpoint
#[derive(Debug, Clone, Copy)]
struct StageDigests {
    raw: ContentDigest,
    processed: Option<ContentDigest>,
    stored: Option<ContentDigest>,
}

#[derive(Debug)]
enum Outcome {
    Stored(Vec<u8>),
    Reference { canonical: u64, stage: DedupStage },
}

/// Result of running content through the pipeline, not yet committed
#[derive(Debug)]
struct Prepared {
    original_size: u64,
    raw_crc: u32,
    file_type: FileTypeTag,
    compression: CompressionType,
    level: u8,
    encryption: EncryptionType,
    digests: StageDigests,
    outcome: Outcome,
}

impl Package {
    /// Add `content` under `path` and return the new FileID
    pub fn add_file(&mut self, path: &str, content: &[u8], options: &AddFileOptions) -> Result<u64> {
        self.ensure_mutable()?;
        let path = normalize_path(path)?;
        if self.file_by_path(&path).is_some() {
            return Err(PackageError::InvalidPath {
                path,
                reason: "already exists in the package".to_string(),
            });
        }
        let tags = encode_tags(&options.tags)?;
        let file_id = self.next_file_id.ok_or_else(|| {
            PackageError::invalid("file_id", "every FileID up to u64::MAX is in use")
        })?;

        let file_type = options
            .file_type
            .unwrap_or_else(|| self.classify(&path, content));
        let compression =
            self.resolve_compression(options.compression, content.len() as u64, file_type);
        let level = match options.level {
            Some(level) => compression.effective_level(level)?,
            None => self.config.compression.level_for(compression)?,
        };
        let prepared =
            self.prepare(None, content, file_type, compression, level, options.encryption)?;

        let mut path_entry = PathEntry::new(path.clone()).with_mode(options.mode.unwrap_or(0o644));
        let now = (now_nanos().max(0)) as u64;
        let mod_time = if options.mod_time == 0 { now } else { options.mod_time };
        path_entry = path_entry.with_times(mod_time, now, now);

        let (mut entry, data) = self.commit(file_id, prepared);
        entry.paths.push(path_entry);
        if !options.tags.is_empty() {
            entry.set_optional(OptionalDataType::Tags, Some(tags));
        }
        if let Err(err) = entry.validate() {
            self.dedup.release(file_id);
            return Err(err);
        }

        self.next_file_id = file_id.checked_add(1);
        debug!(
            file_id,
            path = %path,
            size = content.len(),
            compression = %entry.compression,
            reference = ?entry.content_reference(),
            "Added file"
        );
        self.slots.push(EntrySlot {
            entry,
            data,
            on_disk: None,
        });
        self.touch_content();
        Ok(file_id)
    }

    /// Replace the content of `file_id`, keeping its identity, paths and tags
    pub fn update_file(&mut self, file_id: u64, content: &[u8], options: &AddFileOptions) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_regular_file(file_id)?;
        let current = self
            .file_by_id(file_id)
            .ok_or_else(|| PackageError::FileNotFound(format!("file id {}", file_id)))?
            .clone();
        let referenced_by = self.reference_count(file_id);
        if referenced_by > 0 {
            return Err(PackageError::invalid(
                "file_id",
                format!(
                    "content of file {} is shared by {} other files",
                    file_id, referenced_by
                ),
            ));
        }

        let file_type = options
            .file_type
            .unwrap_or_else(|| FileTypeTag::from_u16(current.file_type));
        let compression =
            self.resolve_compression(options.compression, content.len() as u64, file_type);
        let level = match options.level {
            Some(level) => compression.effective_level(level)?,
            None => self.config.compression.level_for(compression)?,
        };
        let prepared = self.prepare(
            Some(file_id),
            content,
            file_type,
            compression,
            level,
            options.encryption,
        )?;

        self.dedup.release(file_id);
        let (mut entry, data) = self.commit(file_id, prepared);
        if let Some(tags) = current.optional(OptionalDataType::Tags) {
            entry.set_optional(OptionalDataType::Tags, Some(tags.to_vec()));
        }
        entry.paths = current.paths;
        entry.file_version = current.file_version.wrapping_add(1);
        entry.metadata_version = current.metadata_version;

        let slot = self.slot_mut(file_id)?;
        slot.entry = entry;
        slot.data = data;
        slot.on_disk = None;
        debug!(file_id, size = content.len(), "Updated file");
        self.touch_content();
        Ok(())
    }

    /// Remove an entry; fails while other entries reference its content
    pub fn remove_file(&mut self, file_id: u64) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_regular_file(file_id)?;
        let position = self
            .slots
            .iter()
            .position(|s| s.entry.file_id == file_id)
            .ok_or_else(|| PackageError::FileNotFound(format!("file id {}", file_id)))?;
        let referenced_by = self.reference_count(file_id);
        if referenced_by > 0 {
            return Err(PackageError::invalid(
                "file_id",
                format!(
                    "file {} holds content referenced by {} other files; remove those first",
                    file_id, referenced_by
                ),
            ));
        }
        let slot = self.slots.remove(position);
        if slot.entry.content_reference().is_none() {
            self.dedup.release(file_id);
        }
        debug!(file_id, "Removed file");
        self.touch_content();
        Ok(())
    }

    /// Make the content of `file_id` visible under another path
    pub fn add_path(&mut self, file_id: u64, path: PathEntry) -> Result<()> {
        self.ensure_mutable()?;
        let normalized = normalize_path(&path.path)?;
        if self.file_by_path(&normalized).is_some() {
            return Err(PackageError::InvalidPath {
                path: normalized,
                reason: "already exists in the package".to_string(),
            });
        }
        let slot = self.slot_mut(file_id)?;
        slot.entry.paths.push(PathEntry {
            path: normalized,
            ..path
        });
        mark_metadata_changed(slot);
        self.touch_metadata();
        Ok(())
    }

    /// Drop one path alias; an entry always keeps at least one path
    pub fn remove_path(&mut self, file_id: u64, path: &str) -> Result<()> {
        self.ensure_mutable()?;
        let normalized = normalize_path(path)?;
        let slot = self.slot_mut(file_id)?;
        let position = slot
            .entry
            .paths
            .iter()
            .position(|p| p.path == normalized)
            .ok_or_else(|| PackageError::FileNotFound(normalized.clone()))?;
        if slot.entry.paths.len() == 1 {
            return Err(PackageError::invalid(
                "path",
                "cannot remove the only path of a file",
            ));
        }
        slot.entry.paths.remove(position);
        mark_metadata_changed(slot);
        self.touch_metadata();
        Ok(())
    }

    /// Replace the per-file tags (an empty list removes them)
    pub fn set_tags(&mut self, file_id: u64, tags: &[(String, String)]) -> Result<()> {
        self.ensure_mutable()?;
        let encoded = encode_tags(tags)?;
        let slot = self.slot_mut(file_id)?;
        let value = if tags.is_empty() { None } else { Some(encoded) };
        slot.entry.set_optional(OptionalDataType::Tags, value);
        mark_metadata_changed(slot);
        self.touch_metadata();
        Ok(())
    }

    pub fn tags(&self, file_id: u64) -> Result<Vec<(String, String)>> {
        let entry = self
            .file_by_id(file_id)
            .ok_or_else(|| PackageError::FileNotFound(format!("file id {}", file_id)))?;
        match entry.optional(OptionalDataType::Tags) {
            Some(data) => decode_tags(data),
            None => Ok(Vec::new()),
        }
    }

    /// Original content of `file_id`
    ///
    /// Resolves content references, verifies the stored checksum, then
    /// decrypts and decompresses and verifies the raw checksum.
    pub fn read_file(&self, file_id: u64) -> Result<Vec<u8>> {
        self.context.check("read_file")?;
        let slot = self
            .slot(file_id)
            .ok_or_else(|| PackageError::FileNotFound(format!("file id {}", file_id)))?;
        let holder = match slot.entry.content_reference() {
            Some(canonical) => self.slot(canonical).ok_or_else(|| {
                PackageError::InconsistentIndex(format!(
                    "file {} references missing file {}",
                    file_id, canonical
                ))
            })?,
            None => slot,
        };
        let content = self.decode_payload(holder)?;
        let actual = crc32fast::hash(&content);
        if actual != slot.entry.raw_checksum {
            return Err(PackageError::ChecksumMismatch {
                what: format!("file {} content", file_id),
                expected: slot.entry.raw_checksum,
                actual,
            });
        }
        Ok(content)
    }

    pub fn read_file_by_path(&self, path: &str) -> Result<Vec<u8>> {
        let file_id = self
            .file_by_path(path)
            .map(|e| e.file_id)
            .ok_or_else(|| PackageError::FileNotFound(path.to_string()))?;
        self.read_file(file_id)
    }

    /// Bytes of the data block held by `slot`
    pub(crate) fn stored_bytes(&self, slot: &EntrySlot) -> Result<Vec<u8>> {
        match &slot.data {
            DataSource::Memory(bytes) => Ok(bytes.clone()),
            DataSource::Disk { offset } => {
                let backing = self.backing.as_ref().ok_or_else(|| {
                    PackageError::InconsistentIndex(format!(
                        "file {} has on-disk data but the package has no backing file",
                        slot.entry.file_id
                    ))
                })?;
                let mut file = backing.file.lock();
                file.read_at(*offset, slot.entry.stored_size as usize)
            }
            DataSource::Reference => Err(PackageError::InconsistentIndex(format!(
                "file {} is a reference and holds no data",
                slot.entry.file_id
            ))),
        }
    }

    fn decode_payload(&self, slot: &EntrySlot) -> Result<Vec<u8>> {
        let entry = &slot.entry;
        let stored = self.stored_bytes(slot)?;
        let actual = crc32fast::hash(&stored);
        if actual != entry.stored_checksum {
            return Err(PackageError::ChecksumMismatch {
                what: format!("file {} stored data", entry.file_id),
                expected: entry.stored_checksum,
                actual,
            });
        }
        let processed = self.keys.decrypt(&stored, entry.encryption)?;
        if entry.compression == CompressionType::None {
            if processed.len() as u64 != entry.original_size {
                return Err(PackageError::malformed(
                    "FileEntry",
                    "OriginalSize",
                    format!(
                        "file {} holds {} bytes, expected {}",
                        entry.file_id,
                        processed.len(),
                        entry.original_size
                    ),
                ));
            }
            return Ok(processed);
        }
        self.compressor.decompress_to_vec(
            &processed,
            entry.compression,
            entry.original_size,
            &self.context,
        )
    }

    /// Re-encode every stored payload with `target`
    ///
    /// All payloads are re-encoded before any entry changes, so a failure
    /// leaves the package as it was.
    pub(crate) fn recompress_all(&mut self, target: CompressionType) -> Result<usize> {
        let level = self.config.compression.level_for(target)?;
        let mut staged = Vec::new();
        for slot in &self.slots {
            let entry = &slot.entry;
            if entry.content_reference().is_some()
                || is_special_file_type(entry.file_type)
                || (entry.compression == target && entry.compression_level == level)
            {
                continue;
            }
            self.context.check("recompress")?;
            let content = self.decode_payload(slot)?;
            let (stored, digests) =
                self.encode_payload(&content, target, level, entry.encryption)?;
            staged.push((entry.file_id, stored, digests));
        }
        if staged.is_empty() {
            return Ok(0);
        }

        let count = staged.len();
        for (file_id, stored, digests) in staged {
            self.dedup.release(file_id);
            let slot = self.slot_mut(file_id)?;
            let encryption = slot.entry.encryption;
            apply_stored(&mut slot.entry, &stored, target, level);
            slot.data = DataSource::Memory(stored);
            slot.on_disk = None;
            if let Some((holder, stage)) = self.register(file_id, target, level, encryption, &digests)
            {
                self.join_recompressed(file_id, holder, stage)?;
            }
        }
        info!(count, compression = %target, "Recompressed stored payloads");
        self.touch_content();
        Ok(count)
    }

    /// A recompressed payload matched one already stored under the target
    /// codec; fold it into a reference when nothing depends on it
    fn join_recompressed(&mut self, file_id: u64, holder: u64, stage: DedupStage) -> Result<()> {
        let canonical = self.usable_canonical(Some(holder), Some(file_id));
        let Some(canonical) = canonical.filter(|_| self.reference_count(file_id) == 0) else {
            debug!(file_id, holder, ?stage, "Duplicate content kept as a separate copy");
            return Ok(());
        };
        self.dedup.release(file_id);
        let saved = self.slot(canonical).map_or(0, |s| s.entry.stored_size);
        self.dedup.record_hit(stage, saved);
        let slot = self.slot_mut(file_id)?;
        make_reference(&mut slot.entry, canonical);
        slot.data = DataSource::Reference;
        debug!(file_id, canonical, ?stage, "Deduplicated content after recompression");
        Ok(())
    }

    fn classify(&self, path: &str, content: &[u8]) -> FileTypeTag {
        let sample = &content[..content.len().min(CLASSIFY_SAMPLE_LEN)];
        self.classifier.classify(path, sample)
    }

    fn resolve_compression(
        &self,
        requested: CompressionChoice,
        size: u64,
        file_type: FileTypeTag,
    ) -> CompressionType {
        if let Some(compression) = requested
            .resolve()
            .or_else(|| self.config.compression.default_type.resolve())
        {
            return compression;
        }
        match self.header.compression_type() {
            Ok(compression) if compression != CompressionType::None => compression,
            _ => {
                let mut profile = self.content_profile();
                profile.add(size, file_type);
                select_compression(&profile, self.config.compression.archival)
            }
        }
    }

    /// Canonical holder found by a dedup lookup, if it may be referenced
    fn usable_canonical(&self, found: Option<u64>, exclude: Option<u64>) -> Option<u64> {
        let id = found?;
        if Some(id) == exclude {
            return None;
        }
        self.slot(id)
            .filter(|s| s.entry.content_reference().is_none())
            .map(|s| s.entry.file_id)
    }

    fn lookup(
        &self,
        stage: DedupStage,
        variant: StageVariant,
        digest: &ContentDigest,
        exclude: Option<u64>,
    ) -> Option<u64> {
        if !self.config.dedup.enabled(stage) {
            return None;
        }
        self.usable_canonical(self.dedup.lookup(stage, variant, digest), exclude)
    }

    /// Compress then encrypt, returning the stored bytes and stage digests
    fn encode_payload(
        &self,
        content: &[u8],
        compression: CompressionType,
        level: u8,
        encryption: EncryptionType,
    ) -> Result<(Vec<u8>, StageDigests)> {
        let raw = ContentDigest::compute(content);
        let processed = if compression == CompressionType::None {
            content.to_vec()
        } else {
            self.compressor
                .compress_to_vec(content, compression, level, &self.context)?
        };
        let processed_digest = ContentDigest::compute(&processed);
        self.context.check("encrypt")?;
        let stored = self.keys.encrypt(&processed, encryption)?;
        let stored_digest = ContentDigest::compute(&stored);
        Ok((
            stored,
            StageDigests {
                raw,
                processed: Some(processed_digest),
                stored: Some(stored_digest),
            },
        ))
    }

    /// Run content through the pipeline without touching package state
    fn prepare(
        &self,
        exclude: Option<u64>,
        content: &[u8],
        file_type: FileTypeTag,
        compression: CompressionType,
        level: u8,
        encryption: EncryptionType,
    ) -> Result<Prepared> {
        self.context.check("add_file")?;
        if !self.keys.supports(encryption) {
            return Err(PackageError::Key(format!(
                "no key available for {:?} encryption",
                encryption
            )));
        }
        let mut prepared = Prepared {
            original_size: content.len() as u64,
            raw_crc: crc32fast::hash(content),
            file_type,
            compression,
            level,
            encryption,
            digests: StageDigests {
                raw: ContentDigest::compute(content),
                processed: None,
                stored: None,
            },
            outcome: Outcome::Stored(Vec::new()),
        };

        let raw = prepared.digests.raw;
        if let Some(canonical) =
            self.lookup(DedupStage::Raw, StageVariant::raw(encryption), &raw, exclude)
        {
            prepared.outcome = Outcome::Reference {
                canonical,
                stage: DedupStage::Raw,
            };
            return Ok(prepared);
        }

        let variant = StageVariant::coded(compression, level, encryption);
        let processed = if compression == CompressionType::None {
            content.to_vec()
        } else {
            self.compressor
                .compress_to_vec(content, compression, level, &self.context)?
        };
        let processed_digest = ContentDigest::compute(&processed);
        prepared.digests.processed = Some(processed_digest);
        if let Some(canonical) =
            self.lookup(DedupStage::Processed, variant, &processed_digest, exclude)
        {
            prepared.outcome = Outcome::Reference {
                canonical,
                stage: DedupStage::Processed,
            };
            return Ok(prepared);
        }

        self.context.check("encrypt")?;
        let stored = self.keys.encrypt(&processed, encryption)?;
        let stored_digest = ContentDigest::compute(&stored);
        prepared.digests.stored = Some(stored_digest);
        if let Some(canonical) = self.lookup(DedupStage::Final, variant, &stored_digest, exclude) {
            prepared.outcome = Outcome::Reference {
                canonical,
                stage: DedupStage::Final,
            };
            return Ok(prepared);
        }

        prepared.outcome = Outcome::Stored(stored);
        Ok(prepared)
    }

    /// Register `file_id` at every enabled stage, returning the first
    /// existing holder if another entry already claimed the content
    fn register(
        &self,
        file_id: u64,
        compression: CompressionType,
        level: u8,
        encryption: EncryptionType,
        digests: &StageDigests,
    ) -> Option<(u64, DedupStage)> {
        let variant = StageVariant::coded(compression, level, encryption);
        let claims = [
            (DedupStage::Raw, StageVariant::raw(encryption), Some(digests.raw)),
            (DedupStage::Processed, variant, digests.processed),
            (DedupStage::Final, variant, digests.stored),
        ];
        for (stage, variant, digest) in claims {
            let Some(digest) = digest else { continue };
            if !self.config.dedup.enabled(stage) {
                continue;
            }
            if let Claim::Existing(holder) = self.dedup.claim_or_join(stage, variant, &digest, file_id)
            {
                if holder != file_id {
                    return Some((holder, stage));
                }
            }
        }
        None
    }

    /// Commit a prepared payload: claim dedup slots and build the entry
    fn commit(&self, file_id: u64, prepared: Prepared) -> (FileEntry, DataSource) {
        let mut entry = FileEntry::new(file_id);
        entry.original_size = prepared.original_size;
        entry.raw_checksum = prepared.raw_crc;
        entry.file_type = prepared.file_type as u16;
        entry.hashes.push(HashEntry::new(
            HashType::Sha256,
            HashPurpose::Deduplication,
            prepared.digests.raw.strong.to_vec(),
        ));
        entry.hashes.push(HashEntry::new(
            HashType::Xxh3,
            HashPurpose::FastLookup,
            prepared.digests.raw.fast.to_le_bytes().to_vec(),
        ));

        let (canonical, stage) = match prepared.outcome {
            Outcome::Reference { canonical, stage } => (canonical, stage),
            Outcome::Stored(stored) => match self.register(
                file_id,
                prepared.compression,
                prepared.level,
                prepared.encryption,
                &prepared.digests,
            ) {
                Some(existing) => {
                    self.dedup.release(file_id);
                    existing
                }
                None => {
                    entry.encryption = prepared.encryption;
                    apply_stored(&mut entry, &stored, prepared.compression, prepared.level);
                    return (entry, DataSource::Memory(stored));
                }
            },
        };

        let saved = self.slot(canonical).map_or(0, |s| s.entry.stored_size);
        self.dedup.record_hit(stage, saved);
        debug!(file_id, canonical, ?stage, "Deduplicated content");
        entry.set_content_reference(Some(canonical));
        (entry, DataSource::Reference)
    }
}

/// Record codec, sizes and stored-data hashes for a stored payload
fn apply_stored(entry: &mut FileEntry, stored: &[u8], compression: CompressionType, level: u8) {
    entry.compression = compression;
    entry.compression_level = level;
    entry.stored_size = stored.len() as u64;
    entry.stored_checksum = crc32fast::hash(stored);
    entry
        .hashes
        .retain(|h| !(h.hash_type == HashType::Sha256 && h.purpose == HashPurpose::Integrity));
    entry.hashes.push(HashEntry::new(
        HashType::Sha256,
        HashPurpose::Integrity,
        Sha256::digest(stored).to_vec(),
    ));
}

/// Drop the data block of `entry` and point it at `canonical`
fn make_reference(entry: &mut FileEntry, canonical: u64) {
    entry.compression = CompressionType::None;
    entry.compression_level = 0;
    entry.encryption = EncryptionType::None;
    entry.stored_size = 0;
    entry.stored_checksum = 0;
    entry.hashes.retain(|h| h.purpose != HashPurpose::Integrity);
    entry.set_content_reference(Some(canonical));
}

fn mark_metadata_changed(slot: &mut EntrySlot) {
    slot.entry.metadata_version = slot.entry.metadata_version.wrapping_add(1);
    slot.on_disk = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageConfig;
    use crate::dedup::DedupConfig;
    use crate::encryption::KeyProvider;
    use crate::error::ErrorKind;

    fn text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog\n"
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_small_file_auto_selects_none() {
        let mut package = Package::new();
        let content = text(1024);
        let id = package
            .add_file("docs/readme.txt", &content, &AddFileOptions::new())
            .unwrap();
        let entry = package.file_by_id(id).unwrap();
        assert_eq!(entry.compression, CompressionType::None);
        assert_eq!(entry.stored_size, 1024);
        assert_eq!(package.read_file(id).unwrap(), content);
        assert_eq!(package.read_file_by_path("/docs/readme.txt").unwrap(), content);
    }

    #[test]
    fn test_explicit_compression_round_trip() {
        let config = PackageConfig {
            dedup: DedupConfig::disabled(),
            ..PackageConfig::default()
        };
        let mut package = Package::with_config(config).unwrap();
        let content = text(200_000);
        for (path, choice) in [
            ("a.txt", CompressionChoice::Zstd),
            ("b.txt", CompressionChoice::Lz4),
            ("c.txt", CompressionChoice::Lzma),
        ] {
            let id = package
                .add_file(path, &content, &AddFileOptions::new().compression(choice))
                .unwrap();
            let entry = package.file_by_id(id).unwrap();
            assert_eq!(entry.compression, choice.resolve().unwrap());
            assert!(entry.stored_size < entry.original_size);
        }
        for id in 1..=3 {
            assert_eq!(package.read_file(id).unwrap(), content);
        }
    }

    #[test]
    fn test_raw_dedup_creates_reference() {
        let mut package = Package::new();
        let content = text(4096);
        let first = package
            .add_file("one.txt", &content, &AddFileOptions::new().mode(0o600))
            .unwrap();
        let second = package
            .add_file("two.txt", &content, &AddFileOptions::new().mode(0o755))
            .unwrap();

        let entry = package.file_by_id(second).unwrap();
        assert_eq!(entry.content_reference(), Some(first));
        assert_eq!(entry.data_block_len(), 0);
        assert_eq!(entry.paths[0].mode, 0o755);
        assert_eq!(package.file_by_id(first).unwrap().paths[0].mode, 0o600);
        assert_eq!(package.read_file(second).unwrap(), content);
        assert_eq!(package.reference_count(first), 1);
        assert_eq!(package.dedup_stats().raw_hits, 1);
        assert_eq!(package.info().stored_count, 1);
    }

    #[test]
    fn test_dedup_keyed_by_encryption() {
        let keys = KeyProvider::new().with_aes_key(KeyProvider::generate_key());
        let mut package = Package::new();
        package.set_key_provider(keys);
        let content = text(2048);
        package
            .add_file("plain.txt", &content, &AddFileOptions::new())
            .unwrap();
        let sealed = package
            .add_file(
                "sealed.txt",
                &content,
                &AddFileOptions::new().encryption(EncryptionType::Aes256Gcm),
            )
            .unwrap();
        let entry = package.file_by_id(sealed).unwrap();
        assert_eq!(entry.content_reference(), None);
        assert_eq!(entry.encryption, EncryptionType::Aes256Gcm);
        assert_eq!(package.read_file(sealed).unwrap(), content);
    }

    #[test]
    fn test_disabled_dedup_stores_twice() {
        let config = PackageConfig {
            dedup: DedupConfig::disabled(),
            ..PackageConfig::default()
        };
        let mut package = Package::with_config(config).unwrap();
        let content = text(512);
        package.add_file("a", &content, &AddFileOptions::new()).unwrap();
        let b = package.add_file("b", &content, &AddFileOptions::new()).unwrap();
        assert_eq!(package.file_by_id(b).unwrap().content_reference(), None);
        assert_eq!(package.info().stored_count, 2);
    }

    #[test]
    fn test_processed_stage_dedup() {
        let config = PackageConfig {
            dedup: DedupConfig {
                raw: false,
                processed: true,
                final_stage: false,
            },
            ..PackageConfig::default()
        };
        let mut package = Package::with_config(config).unwrap();
        let content = text(10_000);
        let options = AddFileOptions::new().compression(CompressionChoice::Zstd);
        let a = package.add_file("a", &content, &options).unwrap();
        let b = package.add_file("b", &content, &options).unwrap();
        assert_eq!(package.file_by_id(b).unwrap().content_reference(), Some(a));
        assert_eq!(package.dedup_stats().processed_hits, 1);

        // A different level is a different stage key
        let c = package
            .add_file("c", &content, &options.clone().level(9))
            .unwrap();
        assert_eq!(package.file_by_id(c).unwrap().content_reference(), None);
    }

    #[test]
    fn test_missing_key_rejected_without_state() {
        let mut package = Package::new();
        let err = package
            .add_file(
                "secret.bin",
                b"payload",
                &AddFileOptions::new().encryption(EncryptionType::Aes256Gcm),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert_eq!(package.file_count(), 0);
        assert_eq!(package.dedup_stats(), Default::default());
    }

    #[test]
    fn test_cancelled_add_leaves_no_dedup_state() {
        let mut package = Package::new();
        let ctx = crate::context::Context::new();
        package.set_context(ctx.clone());
        ctx.cancel();
        let err = package
            .add_file("a.txt", b"abc", &AddFileOptions::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Context);
        package.set_context(crate::context::Context::new());
        let a = package.add_file("a.txt", b"abc", &AddFileOptions::new()).unwrap();
        assert_eq!(package.file_by_id(a).unwrap().content_reference(), None);
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut package = Package::new();
        package.add_file("a/b.txt", b"1", &AddFileOptions::new()).unwrap();
        let err = package
            .add_file("/a//b.txt", b"2", &AddFileOptions::new())
            .unwrap_err();
        assert!(matches!(err, PackageError::InvalidPath { .. }));
    }

    #[test]
    fn test_remove_referenced_canonical_rejected() {
        let mut package = Package::new();
        let a = package.add_file("a", b"same", &AddFileOptions::new()).unwrap();
        let b = package.add_file("b", b"same", &AddFileOptions::new()).unwrap();
        let err = package.remove_file(a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        package.remove_file(b).unwrap();
        package.remove_file(a).unwrap();
        assert_eq!(package.file_count(), 0);

        // Released content can be stored again
        let c = package.add_file("c", b"same", &AddFileOptions::new()).unwrap();
        assert_eq!(package.file_by_id(c).unwrap().content_reference(), None);
    }

    #[test]
    fn test_update_file_bumps_version() {
        let mut package = Package::new();
        let id = package
            .add_file("cfg.toml", b"v = 1", &AddFileOptions::new().tag("env", "prod"))
            .unwrap();
        package
            .update_file(id, b"v = 2", &AddFileOptions::new())
            .unwrap();
        let entry = package.file_by_id(id).unwrap();
        assert_eq!(entry.file_version, 2);
        assert_eq!(entry.primary_path(), Some("cfg.toml"));
        assert_eq!(package.read_file(id).unwrap(), b"v = 2");
        assert_eq!(
            package.tags(id).unwrap(),
            vec![("env".to_string(), "prod".to_string())]
        );
    }

    #[test]
    fn test_path_aliases() {
        let mut package = Package::new();
        let id = package.add_file("bin/tool", b"\x7fELF", &AddFileOptions::new()).unwrap();
        package
            .add_path(id, PathEntry::new("usr/bin/tool").with_mode(0o755))
            .unwrap();
        assert_eq!(package.file_by_path("usr/bin/tool").unwrap().file_id, id);
        assert_eq!(package.file_by_id(id).unwrap().metadata_version, 2);

        package.remove_path(id, "bin/tool").unwrap();
        assert!(package.file_by_path("bin/tool").is_none());
        let err = package.remove_path(id, "usr/bin/tool").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_tags_set_feature_flag() {
        let mut package = Package::new();
        let id = package.add_file("a", b"1", &AddFileOptions::new()).unwrap();
        package
            .set_tags(id, &[("owner".to_string(), "ops".to_string())])
            .unwrap();
        assert!(package
            .header()
            .has_feature(crate::header::FLAG_HAS_PER_FILE_TAGS));
        package.set_tags(id, &[]).unwrap();
        assert!(package.tags(id).unwrap().is_empty());
        assert!(!package
            .header()
            .has_feature(crate::header::FLAG_HAS_PER_FILE_TAGS));
    }

    #[test]
    fn test_recompress_all() {
        let mut package = Package::new();
        let content = text(50_000);
        let a = package.add_file("a", &content, &AddFileOptions::new()).unwrap();
        package.add_file("b", &content, &AddFileOptions::new()).unwrap();
        assert_eq!(package.recompress_all(CompressionType::Zstd).unwrap(), 1);
        let entry = package.file_by_id(a).unwrap();
        assert_eq!(entry.compression, CompressionType::Zstd);
        assert!(entry.stored_size < content.len() as u64);
        assert_eq!(package.read_file(2).unwrap(), content);
        assert_eq!(package.recompress_all(CompressionType::Zstd).unwrap(), 0);
    }

    #[test]
    fn test_recompression_joins_processed_duplicates() {
        let config = PackageConfig {
            dedup: DedupConfig {
                raw: false,
                processed: true,
                final_stage: true,
            },
            ..PackageConfig::default()
        };
        let mut package = Package::with_config(config).unwrap();
        let content = text(2_000);
        let a = package
            .add_file("a", &content, &AddFileOptions::new().compression(CompressionChoice::Lz4))
            .unwrap();
        let b = package
            .add_file("b", &content, &AddFileOptions::new().compression(CompressionChoice::Zstd))
            .unwrap();
        assert_eq!(package.info().stored_count, 2);

        assert_eq!(package.recompress_all(CompressionType::Zstd).unwrap(), 1);
        let entry = package.file_by_id(a).unwrap();
        assert_eq!(entry.content_reference(), Some(b));
        assert_eq!(entry.stored_size, 0);
        assert_eq!(package.info().stored_count, 1);
        assert_eq!(package.dedup_stats().processed_hits, 1);
        assert_eq!(package.read_file(a).unwrap(), content);
    }

    #[test]
    fn test_add_file_fails_once_ids_run_out() {
        let mut package = Package::new();
        package.next_file_id = Some(u64::MAX);
        let last = package.add_file("last", b"x", &AddFileOptions::new()).unwrap();
        assert_eq!(last, u64::MAX);
        let err = package
            .add_file("one-more", b"y", &AddFileOptions::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(package.file_count(), 1);
    }

    #[test]
    fn test_corrupted_memory_payload_detected() {
        let mut package = Package::new();
        let id = package.add_file("a", b"hello world", &AddFileOptions::new()).unwrap();
        if let DataSource::Memory(bytes) = &mut package.slot_mut(id).unwrap().data {
            bytes[0] ^= 0xFF;
        }
        let err = package.read_file(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }
}
