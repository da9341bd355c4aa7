//! File index: maps FileIDs to entry offsets, ordered by file position

use crate::codec::FieldReader;
use crate::error::{PackageError, Result};
use crate::header::HEADER_SIZE;
use ahash::AHashSet;

pub const INDEX_FIXED_SIZE: usize = 16;
pub const INDEX_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_id: u64,
    /// Absolute offset of the FileEntry in the package file
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex {
    entries: Vec<IndexEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        FileIndex::default()
    }

    /// Append the location of the next entry; offsets must increase
    pub fn push(&mut self, file_id: u64, offset: u64) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if offset <= last.offset {
                return Err(PackageError::InconsistentIndex(format!(
                    "entry {} at offset {} does not follow offset {}",
                    file_id, offset, last.offset
                )));
            }
        }
        self.entries.push(IndexEntry { file_id, offset });
        Ok(())
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offset_of(&self, file_id: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.file_id == file_id)
            .map(|e| e.offset)
    }

    pub fn first_entry_offset(&self) -> u64 {
        self.entries.first().map(|e| e.offset).unwrap_or(0)
    }

    pub fn encoded_size(&self) -> usize {
        INDEX_FIXED_SIZE + self.entries.len() * INDEX_RECORD_SIZE
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| PackageError::invalid("FileIndex.EntryCount", "too many entries"))?;
        let mut out = Vec::with_capacity(self.encoded_size());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.first_entry_offset().to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.file_id.to_le_bytes());
            out.extend_from_slice(&entry.offset.to_le_bytes());
        }
        Ok(out)
    }

    /// Decode and cross-check an index read from `[index_start, index_start + bytes.len())`
    pub fn decode(bytes: &[u8], index_start: u64) -> Result<Self> {
        let mut r = FieldReader::new(bytes, "FileIndex");
        let count = r.u32("EntryCount")? as usize;
        let reserved = r.u32("Reserved")?;
        let first_entry_offset = r.u64("FirstEntryOffset")?;

        if reserved != 0 {
            return Err(PackageError::ReservedNotZero {
                structure: "FileIndex",
                field: "Reserved",
                value: reserved as u64,
            });
        }
        let expected = count
            .checked_mul(INDEX_RECORD_SIZE)
            .and_then(|n| n.checked_add(INDEX_FIXED_SIZE));
        if expected != Some(bytes.len()) {
            return Err(PackageError::InconsistentIndex(format!(
                "{} entries do not fit an index of {} bytes",
                count,
                bytes.len()
            )));
        }

        let mut seen = AHashSet::with_capacity(count);
        let mut index = FileIndex {
            entries: Vec::with_capacity(count),
        };
        for _ in 0..count {
            let file_id = r.u64("FileID")?;
            let offset = r.u64("Offset")?;
            if file_id == 0 {
                return Err(PackageError::InconsistentIndex(
                    "index references file ID 0".to_string(),
                ));
            }
            if !seen.insert(file_id) {
                return Err(PackageError::InconsistentIndex(format!(
                    "file ID {} listed twice",
                    file_id
                )));
            }
            if offset < HEADER_SIZE as u64 || offset >= index_start {
                return Err(PackageError::OutOfBounds {
                    structure: "FileIndex",
                    field: "Offset",
                    offset,
                    length: 0,
                    limit: index_start,
                });
            }
            index.push(file_id, offset)?;
        }

        if index.first_entry_offset() != first_entry_offset {
            return Err(PackageError::InconsistentIndex(format!(
                "first entry offset {} disagrees with entry table ({})",
                first_entry_offset,
                index.first_entry_offset()
            )));
        }
        Ok(index)
    }
}
