//! Persistence: SafeWrite (temp file plus atomic rename) and FastWrite
//! (in-place append)
//!
//! SafeWrite streams the whole package to a temp file beside the target and
//! renames it over the target, so readers only ever see the old or the new
//! package. FastWrite appends changed entries to the file the package was
//! opened from. It first stamps the header with `IndexSize = 0`, and only the
//! final header write clears that marker, so an interrupted FastWrite is
//! detected on the next open and fixed by [`Package::repair`].

use crate::compression::{select_compression, CompressionType};
use crate::config::{CompressionChoice, FastWriteFallback, PackageConfig};
use crate::context::Context;
use crate::error::{PackageError, Result};
use crate::header::{Header, FLAG_HAS_SIGNATURES, HEADER_SIZE, INDEX_SIZE_INCOMPLETE};
use crate::comment::encode_comment;
use crate::index::FileIndex;
use crate::io::{sync_parent_dir, PackageFile};
use crate::package::{now_nanos, Backing, DataSource, Package};
use parking_lot::Mutex;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Strategy a write ended up using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    SafeWrite,
    FastWrite,
}

/// Entry and data offsets of every slot after a write, in slot order
type Placement = Vec<(u64, Option<u64>)>;

fn io_err<'a>(
    operation: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> PackageError + 'a {
    move |e| PackageError::io_at(operation, path, None, e)
}

impl Package {
    /// Persist the package to `path`, picking the strategy from its state
    ///
    /// `compression` sets the package-wide codec (`Unspecified` keeps the
    /// configured or current one, or selects automatically). A signed
    /// package is written verbatim unless `clear_signatures` is set.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        compression: CompressionChoice,
        clear_signatures: bool,
    ) -> Result<WriteStrategy> {
        let path = path.as_ref();
        self.ensure_writable()?;

        if self.signatures.is_some() {
            if clear_signatures {
                self.clear_signatures()?;
            } else {
                let current = self.header.compression_type()?;
                if let Some(requested) = compression.resolve() {
                    if requested != current {
                        return Err(PackageError::SignedPackage);
                    }
                }
                self.safe_write(path)?;
                return Ok(WriteStrategy::SafeWrite);
            }
        }

        let current = self.header.compression_type()?;
        let target = match compression
            .resolve()
            .or_else(|| self.config.compression.default_type.resolve())
        {
            Some(target) => target,
            None if current != CompressionType::None => current,
            None => select_compression(&self.content_profile(), self.config.compression.archival),
        };
        if target != CompressionType::None || current != CompressionType::None {
            self.recompress_all(target)?;
        }
        if target != current {
            self.header.set_compression_type(target);
            self.touch_metadata();
        }

        if self.fast_write_blocker(path).is_none() {
            self.context.check("fast_write")?;
            self.fast_write_in_place()?;
            return Ok(WriteStrategy::FastWrite);
        }
        self.safe_write(path)?;
        Ok(WriteStrategy::SafeWrite)
    }

    /// Rewrite the whole package into a temp file and rename it over `path`
    pub fn safe_write(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.ensure_writable()?;
        self.context.check("safe_write")?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(dir).map_err(io_err("create temp file", dir))?;

        let (header, placement) = {
            let mut out = BufWriter::new(temp.as_file());
            let written = match &self.signatures {
                Some(chain) => {
                    let bytes = chain.to_bytes()?;
                    out.write_all(&bytes).map_err(io_err("write", temp.path()))?;
                    signed_placement(self, chain.prefix())?
                }
                None => self.write_image(&mut out, temp.path(), false)?,
            };
            out.flush().map_err(io_err("flush", temp.path()))?;
            written
        };
        if self.config.write.sync {
            temp.as_file().sync_all().map_err(io_err("sync", temp.path()))?;
        }

        // Last point where the target is still untouched
        self.context.check("safe_write")?;
        temp.persist(path)
            .map_err(|e| PackageError::io_at("rename", path, None, e.error))?;
        if self.config.write.sync {
            sync_parent_dir(path)?;
        }

        self.adopt(path, header, &placement)?;
        info!(
            path = %path.display(),
            files = self.slots.len(),
            signed = self.is_signed(),
            "SafeWrite complete"
        );
        Ok(())
    }

    /// Update `path` in place, or fall back per configuration
    pub fn fast_write(&mut self, path: impl AsRef<Path>) -> Result<WriteStrategy> {
        let path = path.as_ref();
        self.ensure_writable()?;
        if let Some(reason) = self.fast_write_blocker(path) {
            return match self.config.write.fast_write_fallback {
                FastWriteFallback::Error => Err(PackageError::FastWriteUnavailable(reason)),
                FastWriteFallback::SafeWrite => {
                    warn!(reason = %reason, "FastWrite unavailable, falling back to SafeWrite");
                    self.safe_write(path)?;
                    Ok(WriteStrategy::SafeWrite)
                }
            };
        }
        // Checked once: an in-place write is not interrupted midway
        self.context.check("fast_write")?;
        self.fast_write_in_place()?;
        Ok(WriteStrategy::FastWrite)
    }

    /// Rewrite `path` without the dead space left by in-place writes
    pub fn defragment(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let before = self.backing.as_ref().map(|b| b.len);
        self.safe_write(path)?;
        let after = self.backing.as_ref().map(|b| b.len);
        info!(path = %path.display(), ?before, ?after, "Defragmented package");
        Ok(())
    }

    /// Restore a package left inconsistent by an interrupted FastWrite
    ///
    /// The index from before the interrupted write is still intact; the
    /// package is reloaded from it and rewritten with SafeWrite.
    pub fn repair(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (mut package, incomplete) = Package::load(path, PackageConfig::default(), false, true)?;
        if incomplete {
            package.safe_write(path)?;
            info!(path = %path.display(), "Repaired package");
        }
        Ok(package)
    }

    /// Why FastWrite cannot update `path`, if it cannot
    pub fn fast_write_blocker(&self, path: impl AsRef<Path>) -> Option<String> {
        let path = path.as_ref();
        if self.signatures.is_some() {
            return Some("package is signed".to_string());
        }
        let Some(backing) = &self.backing else {
            return Some("package has never been written".to_string());
        };
        let compressed = |h: &Header| {
            h.compression_type()
                .map_or(true, |c| c != CompressionType::None)
        };
        if compressed(&self.header) || compressed(&backing.header) {
            return Some("package is compressed".to_string());
        }
        if backing.header.is_signed() {
            return Some("package file is signed".to_string());
        }
        let Ok(target) = std::fs::canonicalize(path) else {
            return Some(format!("{} does not exist", path.display()));
        };
        if target != backing.path {
            return Some(format!(
                "{} is not the file this package was loaded from",
                path.display()
            ));
        }
        match std::fs::metadata(&target) {
            Ok(meta) if meta.len() == backing.len => {}
            Ok(meta) => {
                return Some(format!(
                    "file length changed from {} to {} since it was loaded",
                    backing.len,
                    meta.len()
                ))
            }
            Err(e) => return Some(format!("cannot stat {}: {}", path.display(), e)),
        }
        if !backing.file.lock().is_writable() {
            return Some("package file is open read-only".to_string());
        }
        None
    }

    /// Serialized package up to where the first signature block goes
    pub(crate) fn seal_prefix(&self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.write_image(&mut out, Path::new("<signature prefix>"), true)?;
        Ok(out.into_inner())
    }

    /// Write header, entries with data, index and comment to `out`
    ///
    /// The header is written last, once the index position and CRC are
    /// known. With `signed` set the header points SignatureOffset at the end
    /// of the image.
    fn write_image<W: Write + Seek>(
        &self,
        out: &mut W,
        target: &Path,
        signed: bool,
    ) -> Result<(Header, Placement)> {
        let ctx = &self.context;
        out.write_all(&[0u8; HEADER_SIZE])
            .map_err(io_err("write", target))?;
        let mut pos = HEADER_SIZE as u64;
        let mut crc = crc32fast::Hasher::new();
        let mut index = FileIndex::new();
        let mut placement = Vec::with_capacity(self.slots.len());

        for slot in &self.slots {
            ctx.check("write")?;
            let encoded = slot.entry.encode()?;
            let entry_offset = pos;
            out.write_all(&encoded).map_err(io_err("write", target))?;
            crc.update(&encoded);
            pos += encoded.len() as u64;

            let data_offset = match &slot.data {
                DataSource::Reference => None,
                DataSource::Memory(bytes) => {
                    out.write_all(bytes).map_err(io_err("write", target))?;
                    crc.update(bytes);
                    Some(pos)
                }
                DataSource::Disk { offset } => {
                    let backing = self.backing.as_ref().ok_or_else(|| {
                        PackageError::InconsistentIndex(format!(
                            "file {} has on-disk data but no backing file",
                            slot.entry.file_id
                        ))
                    })?;
                    let mut file = backing.file.lock();
                    file.copy_range(
                        *offset,
                        slot.entry.stored_size,
                        self.compressor.pool(),
                        ctx,
                        &mut |chunk| {
                            crc.update(chunk);
                            out.write_all(chunk).map_err(io_err("write", target))
                        },
                    )?;
                    Some(pos)
                }
            };
            pos += slot.entry.data_block_len();
            index.push(slot.entry.file_id, entry_offset)?;
            placement.push((entry_offset, data_offset));
            debug!(file_id = slot.entry.file_id, offset = entry_offset, "Wrote entry");
        }

        let mut header = self.header;
        let index_bytes = index.encode()?;
        header.index_start = pos;
        header.index_size = index_bytes.len() as u64;
        out.write_all(&index_bytes).map_err(io_err("write", target))?;
        crc.update(&index_bytes);
        pos += index_bytes.len() as u64;

        match &self.comment {
            Some(text) => {
                let bytes = encode_comment(text)?;
                header.comment_start = pos;
                header.comment_size = bytes.len() as u32;
                out.write_all(&bytes).map_err(io_err("write", target))?;
                crc.update(&bytes);
                pos += bytes.len() as u64;
            }
            None => {
                header.comment_start = 0;
                header.comment_size = 0;
            }
        }

        header.signature_offset = if signed { pos } else { 0 };
        header.set_feature(FLAG_HAS_SIGNATURES, signed);
        header.modified_time = now_nanos();
        header.package_crc = if self.config.write.compute_crc {
            crc.finalize()
        } else {
            0
        };

        out.seek(SeekFrom::Start(0))
            .and_then(|_| out.write_all(&header.to_bytes()))
            .and_then(|_| out.seek(SeekFrom::Start(pos)).map(|_| ()))
            .map_err(io_err("write header", target))?;
        Ok((header, placement))
    }

    /// Append changed entries to the backing file and rewrite its index
    fn fast_write_in_place(&mut self) -> Result<()> {
        let backing = self.backing.take().ok_or_else(|| {
            PackageError::FastWriteUnavailable("package has never been written".to_string())
        })?;
        let result = self.append_changes(&backing);
        self.backing = Some(backing);
        let (header, len, placement, appended) = result?;

        self.apply_placement(&placement);
        self.header = header;
        if let Some(backing) = self.backing.as_mut() {
            backing.header = header;
            backing.len = len;
        }
        info!(appended, len, "FastWrite complete");
        Ok(())
    }

    fn append_changes(&self, backing: &Backing) -> Result<(Header, u64, Placement, usize)> {
        let mut file = backing.file.lock();
        let sync = self.config.write.sync;

        let mut marker = backing.header;
        marker.index_size = INDEX_SIZE_INCOMPLETE;
        file.write_header(&marker)?;
        file.sync()?;

        let mut end = backing.len;
        let mut placement = Vec::with_capacity(self.slots.len());
        let mut appended = 0;
        for slot in &self.slots {
            if let Some(offset) = slot.on_disk {
                let data = match slot.data {
                    DataSource::Disk { offset } => Some(offset),
                    _ => None,
                };
                placement.push((offset, data));
                continue;
            }
            let encoded = slot.entry.encode()?;
            let entry_offset = end;
            file.write_at(end, &encoded)?;
            end += encoded.len() as u64;
            let data = match &slot.data {
                DataSource::Reference => None,
                DataSource::Memory(bytes) => {
                    file.write_at(end, bytes)?;
                    Some(end)
                }
                DataSource::Disk { offset } => {
                    let bytes = file.read_at(*offset, slot.entry.stored_size as usize)?;
                    file.write_at(end, &bytes)?;
                    Some(end)
                }
            };
            end += slot.entry.data_block_len();
            placement.push((entry_offset, data));
            appended += 1;
        }

        let mut order: Vec<(u64, u64)> = self
            .slots
            .iter()
            .zip(&placement)
            .map(|(slot, (offset, _))| (*offset, slot.entry.file_id))
            .collect();
        order.sort_unstable();
        let mut index = FileIndex::new();
        for (offset, file_id) in order {
            index.push(file_id, offset)?;
        }

        let mut header = self.header;
        let index_bytes = index.encode()?;
        header.index_start = end;
        header.index_size = index_bytes.len() as u64;
        file.write_at(end, &index_bytes)?;
        end += index_bytes.len() as u64;

        match &self.comment {
            Some(text) => {
                let bytes = encode_comment(text)?;
                header.comment_start = end;
                header.comment_size = bytes.len() as u32;
                file.write_at(end, &bytes)?;
                end += bytes.len() as u64;
            }
            None => {
                header.comment_start = 0;
                header.comment_size = 0;
            }
        }
        header.signature_offset = 0;
        header.set_feature(FLAG_HAS_SIGNATURES, false);
        header.modified_time = now_nanos();
        header.package_crc = if self.config.write.compute_crc {
            // A fresh context: the in-place write runs to completion
            file.crc32_range(
                HEADER_SIZE as u64,
                header.crc_range_end(),
                self.compressor.pool(),
                &Context::new(),
            )?
        } else {
            0
        };
        if sync {
            file.sync()?;
        }
        file.write_header(&header)?;
        if sync {
            file.sync()?;
        }
        Ok((header, end, placement, appended))
    }

    fn apply_placement(&mut self, placement: &Placement) {
        for (slot, (entry_offset, data_offset)) in self.slots.iter_mut().zip(placement) {
            slot.on_disk = Some(*entry_offset);
            if let Some(offset) = data_offset {
                slot.data = DataSource::Disk { offset: *offset };
            }
        }
    }

    /// Point the package at the file just written to `path`
    fn adopt(&mut self, path: &Path, header: Header, placement: &Placement) -> Result<()> {
        let file = PackageFile::open(path, true)?;
        let len = file.len()?;
        let canonical = std::fs::canonicalize(path).map_err(io_err("canonicalize", path))?;
        // The old handle must be released before slots point at the new file
        self.backing = None;
        self.apply_placement(placement);
        self.header = header;
        self.backing = Some(Backing {
            file: Mutex::new(file),
            path: canonical,
            len,
            header,
        });
        Ok(())
    }
}

/// Entry positions inside a sealed prefix, read back from its own index
fn signed_placement(package: &Package, prefix: &[u8]) -> Result<(Header, Placement)> {
    let header = Header::from_bytes(prefix)?;
    header.validate_bounds(prefix.len() as u64)?;
    let start = header.index_start as usize;
    let index = FileIndex::decode(
        &prefix[start..start + header.index_size as usize],
        header.index_start,
    )?;
    let mut placement = Vec::with_capacity(package.slots.len());
    for slot in &package.slots {
        let entry_offset = index.offset_of(slot.entry.file_id).ok_or_else(|| {
            PackageError::InconsistentIndex(format!(
                "file {} is missing from the signed index",
                slot.entry.file_id
            ))
        })?;
        let data_offset = match slot.entry.content_reference() {
            Some(_) => None,
            None => Some(entry_offset + slot.entry.encoded_size()? as u64),
        };
        placement.push((entry_offset, data_offset));
    }
    Ok((header, placement))
}
