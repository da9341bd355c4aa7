//! Path metadata: per-path properties, directory entries and inheritance
//!
//! Path metadata is kept apart from file entries. It is persisted as a TOML
//! document in a special package entry of type [`PATH_METADATA_FILE_TYPE`],
//! rewritten whenever the metadata changes. Directory paths are stored in
//! normalized form with a trailing `/` (`assets/textures/`).
//!
//! Directories exist either explicitly, through a directory metadata entry,
//! or implicitly, as a parent of some stored file path.

use crate::entry::{decode_tags, FileEntry, PathEntry};
use crate::error::{PackageError, Result};
use crate::package::{DataSource, EntrySlot, Package};
use crate::validation::normalize_path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// First FileEntry type reserved for special metadata files
pub const SPECIAL_FILE_TYPE_MIN: u16 = 65000;

/// FileEntry type of the path metadata file
pub const PATH_METADATA_FILE_TYPE: u16 = 65001;

/// Stored path of the path metadata file
pub const PATH_METADATA_FILE_NAME: &str = "__NVPK_PATH_65001__.nvpkpath";

pub fn is_special_file_type(file_type: u16) -> bool {
    file_type >= SPECIAL_FILE_TYPE_MIN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMetadataType {
    File,
    Directory,
    FileSymlink,
    DirectorySymlink,
}

impl PathMetadataType {
    pub fn is_directory(self) -> bool {
        matches!(
            self,
            PathMetadataType::Directory | PathMetadataType::DirectorySymlink
        )
    }

    pub fn is_symlink(self) -> bool {
        matches!(
            self,
            PathMetadataType::FileSymlink | PathMetadataType::DirectorySymlink
        )
    }
}

/// Whether a directory passes its properties down, and how strongly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInheritance {
    pub enabled: bool,
    /// Higher priority wins when ancestors set the same property
    pub priority: i32,
}

impl PathInheritance {
    pub fn new(priority: i32) -> Self {
        PathInheritance {
            enabled: true,
            priority,
        }
    }
}

/// Descriptive fields of a directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unix nanoseconds
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub modified: i64,
}

/// Filesystem properties recorded for a path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathFileSystem {
    #[serde(default)]
    pub is_executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended_attrs: BTreeMap<String, String>,
}

/// Metadata attached to one path (file, directory or symlink)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMetadataEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub path_type: PathMetadataType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Directories only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inheritance: Option<PathInheritance>,
    /// Directories only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<DirectoryDetails>,
    #[serde(default)]
    pub filesystem: PathFileSystem,
}

impl PathMetadataEntry {
    pub fn new(path: impl Into<String>, path_type: PathMetadataType) -> Self {
        PathMetadataEntry {
            path: path.into(),
            path_type,
            properties: BTreeMap::new(),
            inheritance: None,
            details: None,
            filesystem: PathFileSystem::default(),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        PathMetadataEntry::new(path, PathMetadataType::File)
    }

    pub fn directory(path: impl Into<String>) -> Self {
        PathMetadataEntry::new(path, PathMetadataType::Directory)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_inheritance(mut self, inheritance: PathInheritance) -> Self {
        self.inheritance = Some(inheritance);
        self
    }

    pub fn with_details(mut self, details: DirectoryDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_filesystem(mut self, filesystem: PathFileSystem) -> Self {
        self.filesystem = filesystem;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.path_type.is_directory()
    }

    /// Number of path segments; top-level paths have depth 1
    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }

    /// Directory holding this path, `None` at the top level
    pub fn parent(&self) -> Option<String> {
        parent_directory(&self.path)
    }

    fn inheritance_priority(&self) -> Option<i32> {
        self.inheritance
            .filter(|inheritance| inheritance.enabled)
            .map(|inheritance| inheritance.priority)
    }

    /// Rewrite `path` into its stored form
    fn canonicalize(&mut self) -> Result<()> {
        self.path = canonical_path(&self.path, self.path_type)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let expected = canonical_path(&self.path, self.path_type)?;
        if expected != self.path {
            return Err(PackageError::InvalidPath {
                path: self.path.clone(),
                reason: format!("expected stored form '{}'", expected),
            });
        }
        if !self.is_directory() {
            if self.inheritance.is_some() {
                return Err(PackageError::invalid(
                    "PathMetadataEntry.inheritance",
                    format!("file path '{}' cannot carry inheritance", self.path),
                ));
            }
            if self.details.is_some() {
                return Err(PackageError::invalid(
                    "PathMetadataEntry.details",
                    format!("file path '{}' cannot carry directory details", self.path),
                ));
            }
        }
        if self.path_type.is_symlink()
            && self
                .filesystem
                .link_target
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(PackageError::invalid(
                "PathMetadataEntry.filesystem.link_target",
                format!("symlink '{}' has no target", self.path),
            ));
        }
        Ok(())
    }
}

/// Summary of one path in the package's path tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: String,
    /// `None` for paths known only from stored file paths
    pub entry: Option<PathMetadataEntry>,
    /// Directories: stored files directly inside. Files: entries stored at
    /// the path (0 or 1).
    pub file_count: usize,
    /// Directories directly inside, explicit or implied
    pub subdirectories: Vec<String>,
    pub parent: Option<String>,
    pub depth: usize,
}

impl PathInfo {
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// On-disk shape of the path metadata file
#[derive(Debug, Default, Serialize, Deserialize)]
struct PathMetadataDocument {
    #[serde(default)]
    paths: Vec<PathMetadataEntry>,
}

pub(crate) fn encode_path_metadata(entries: &[PathMetadataEntry]) -> Result<Vec<u8>> {
    let document = PathMetadataDocument {
        paths: entries.to_vec(),
    };
    let text = toml::to_string(&document)
        .map_err(|e| PackageError::invalid("path_metadata", e.to_string()))?;
    Ok(text.into_bytes())
}

pub(crate) fn decode_path_metadata(bytes: &[u8]) -> Result<Vec<PathMetadataEntry>> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        PackageError::malformed("PathMetadataFile", "paths", format!("not UTF-8: {}", e))
    })?;
    let document: PathMetadataDocument = toml::from_str(text)
        .map_err(|e| PackageError::malformed("PathMetadataFile", "paths", e.to_string()))?;
    for entry in &document.paths {
        entry.validate()?;
    }
    Ok(document.paths)
}

/// Stored form of `path`: normalized, with a trailing `/` for directories
pub fn canonical_path(path: &str, path_type: PathMetadataType) -> Result<String> {
    let normalized = normalize_path(path)?;
    if path_type.is_directory() {
        Ok(format!("{}/", normalized))
    } else {
        Ok(normalized)
    }
}

/// Directory holding `path` in stored form, `None` at the top level
pub fn parent_directory(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .rsplit_once('/')
        .map(|(parent, _)| format!("{}/", parent))
}

fn path_depth(path: &str) -> usize {
    path.trim_end_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .count()
}

/// Every directory above a stored file path (`a/b/c.txt` gives `a/` and `a/b/`)
fn implied_directories(path: &str) -> impl Iterator<Item = String> + '_ {
    path.match_indices('/')
        .map(move |(end, _)| path[..=end].to_string())
}

fn fill_metadata_file(entry: &mut FileEntry, bytes: &[u8]) {
    let crc = crc32fast::hash(bytes);
    entry.file_type = PATH_METADATA_FILE_TYPE;
    entry.original_size = bytes.len() as u64;
    entry.stored_size = bytes.len() as u64;
    entry.raw_checksum = crc;
    entry.stored_checksum = crc;
    entry.compression = crate::compression::CompressionType::None;
    entry.compression_level = 0;
    entry.encryption = crate::encryption::EncryptionType::None;
    entry.hashes.clear();
}

impl Package {
    pub fn path_metadata(&self) -> &[PathMetadataEntry] {
        &self.path_metadata
    }

    /// Metadata for `path`, given in file or directory form
    pub fn path_metadata_for(&self, path: &str) -> Option<&PathMetadataEntry> {
        let normalized = normalize_path(path).ok()?;
        self.metadata_position(&normalized)
            .map(|position| &self.path_metadata[position])
    }

    fn metadata_position(&self, normalized: &str) -> Option<usize> {
        self.path_metadata.iter().position(|entry| {
            entry.path == normalized
                || (entry.path.len() == normalized.len() + 1
                    && entry.path.starts_with(normalized)
                    && entry.path.ends_with('/'))
        })
    }

    /// Replace all path metadata and rewrite the path metadata file
    pub fn set_path_metadata(&mut self, entries: Vec<PathMetadataEntry>) -> Result<()> {
        self.ensure_mutable()?;
        let mut entries = entries;
        for entry in &mut entries {
            entry.canonicalize()?;
            entry.validate()?;
        }
        let previous = std::mem::replace(&mut self.path_metadata, entries);
        if let Err(err) = self.save_path_metadata_file() {
            self.path_metadata = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Attach metadata to a path that has none yet
    pub fn add_path_metadata(&mut self, entry: PathMetadataEntry) -> Result<()> {
        self.ensure_mutable()?;
        let mut entry = entry;
        entry.canonicalize()?;
        entry.validate()?;
        if self.path_metadata.iter().any(|e| e.path == entry.path) {
            return Err(PackageError::InvalidPath {
                path: entry.path,
                reason: "already has path metadata".to_string(),
            });
        }
        debug!(path = %entry.path, path_type = ?entry.path_type, "Added path metadata");
        let mut entries = self.path_metadata.clone();
        entries.push(entry);
        self.set_path_metadata(entries)
    }

    /// Attach directory metadata; `path` may omit the trailing `/`
    pub fn add_directory_metadata(
        &mut self,
        path: &str,
        properties: impl IntoIterator<Item = (String, String)>,
        inheritance: Option<PathInheritance>,
        details: Option<DirectoryDetails>,
    ) -> Result<()> {
        let mut entry = PathMetadataEntry::directory(path);
        entry.properties.extend(properties);
        entry.inheritance = inheritance;
        entry.details = details;
        self.add_path_metadata(entry)
    }

    /// Edit the metadata of `path` in place; the path itself cannot change
    pub fn update_path_metadata(
        &mut self,
        path: &str,
        update: impl FnOnce(&mut PathMetadataEntry),
    ) -> Result<()> {
        self.ensure_mutable()?;
        let normalized = normalize_path(path)?;
        let position = self.metadata_position(&normalized).ok_or_else(|| {
            PackageError::FileNotFound(format!("path metadata for {}", normalized))
        })?;
        let mut entries = self.path_metadata.clone();
        let stored = entries[position].path.clone();
        update(&mut entries[position]);
        if entries[position].path != stored {
            return Err(PackageError::invalid(
                "PathMetadataEntry.path",
                "updates cannot move an entry to another path",
            ));
        }
        entries[position].validate()?;
        self.set_path_metadata(entries)
    }

    pub fn remove_path_metadata(&mut self, path: &str) -> Result<()> {
        self.ensure_mutable()?;
        let normalized = normalize_path(path)?;
        let position = self.metadata_position(&normalized).ok_or_else(|| {
            PackageError::FileNotFound(format!("path metadata for {}", normalized))
        })?;
        let mut entries = self.path_metadata.clone();
        let removed = entries.remove(position);
        debug!(path = %removed.path, "Removed path metadata");
        self.set_path_metadata(entries)
    }

    pub fn validate_path_metadata(&self) -> Result<()> {
        self.path_metadata
            .iter()
            .try_for_each(PathMetadataEntry::validate)
    }

    /// Paths whose metadata contradicts itself or the stored files
    ///
    /// A path conflicts when it has more than one metadata entry, when a
    /// directory entry names a stored file, or when a file entry names a
    /// directory implied by stored files.
    pub fn path_conflicts(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut conflicts = BTreeSet::new();
        let files: BTreeSet<&str> = self.stored_paths().collect();
        let directories: BTreeSet<String> = self
            .stored_paths()
            .flat_map(implied_directories)
            .collect();
        for entry in &self.path_metadata {
            if !seen.insert(entry.path.as_str()) {
                conflicts.insert(entry.path.clone());
            }
            let clash = if entry.is_directory() {
                files.contains(entry.path.trim_end_matches('/'))
            } else {
                directories.contains(&format!("{}/", entry.path))
            };
            if clash {
                conflicts.insert(entry.path.clone());
            }
        }
        conflicts.into_iter().collect()
    }

    /// Properties passed down to `path` by ancestor directories
    ///
    /// Only directories with inheritance enabled contribute. When two set the
    /// same key, the higher priority wins, then the nearer directory.
    pub fn inherited_properties(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let normalized = normalize_path(path)?;
        let mut sources = Vec::new();
        let mut ancestor = parent_directory(&normalized);
        let mut distance = 0usize;
        while let Some(directory) = ancestor {
            if let Some(entry) = self.path_metadata.iter().find(|e| e.path == directory) {
                if let Some(priority) = entry.inheritance_priority() {
                    sources.push((priority, distance, entry));
                }
            }
            ancestor = parent_directory(&directory);
            distance += 1;
        }
        // Weakest first so stronger sources overwrite
        sources.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        let mut merged = BTreeMap::new();
        for (_, _, entry) in sources {
            merged.extend(
                entry
                    .properties
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }
        Ok(merged)
    }

    /// Inherited properties, overridden by the path's own metadata, then by
    /// the per-file tags of the entry stored at the path
    pub fn effective_properties(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let normalized = normalize_path(path)?;
        let mut merged = self.inherited_properties(&normalized)?;
        if let Some(position) = self.metadata_position(&normalized) {
            merged.extend(self.path_metadata[position].properties.clone());
        }
        if let Some(entry) = self.file_by_path(&normalized) {
            if let Some(tags) = entry.optional(crate::entry::OptionalDataType::Tags) {
                merged.extend(decode_tags(tags)?);
            }
        }
        Ok(merged)
    }

    /// Paths of entries holding regular content
    fn stored_paths(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .filter(|s| !is_special_file_type(s.entry.file_type))
            .flat_map(|s| s.entry.paths.iter().map(|p| p.path.as_str()))
    }

    /// Every directory, explicit or implied, with its metadata if any
    fn directory_map(&self) -> BTreeMap<String, Option<&PathMetadataEntry>> {
        let mut directories = BTreeMap::new();
        for path in self.stored_paths() {
            for directory in implied_directories(path) {
                directories.entry(directory).or_insert(None);
            }
        }
        for entry in self.path_metadata.iter().filter(|e| e.is_directory()) {
            directories.insert(entry.path.clone(), Some(entry));
        }
        directories
    }

    fn describe(
        &self,
        path: &str,
        entry: Option<&PathMetadataEntry>,
        directories: &BTreeMap<String, Option<&PathMetadataEntry>>,
    ) -> PathInfo {
        let is_directory = path.ends_with('/');
        let (file_count, subdirectories) = if is_directory {
            let files = self
                .stored_paths()
                .filter(|p| parent_directory(p).as_deref() == Some(path))
                .count();
            let subdirectories = directories
                .keys()
                .filter(|d| parent_directory(d).as_deref() == Some(path))
                .cloned()
                .collect();
            (files, subdirectories)
        } else {
            (self.stored_paths().filter(|p| *p == path).count(), Vec::new())
        };
        PathInfo {
            path: path.to_string(),
            entry: entry.cloned(),
            file_count,
            subdirectories,
            parent: parent_directory(path),
            depth: path_depth(path),
        }
    }

    /// Summary of `path`: a metadata entry, a directory or a stored file
    pub fn path_info(&self, path: &str) -> Result<PathInfo> {
        let normalized = normalize_path(path)?;
        let directories = self.directory_map();
        if let Some(position) = self.metadata_position(&normalized) {
            let entry = &self.path_metadata[position];
            return Ok(self.describe(&entry.path, Some(entry), &directories));
        }
        let as_directory = format!("{}/", normalized);
        if directories.contains_key(&as_directory) {
            return Ok(self.describe(&as_directory, None, &directories));
        }
        if self.stored_paths().any(|p| p == normalized) {
            return Ok(self.describe(&normalized, None, &directories));
        }
        Err(PackageError::FileNotFound(normalized))
    }

    /// One summary per path metadata entry
    pub fn list_paths(&self) -> Vec<PathInfo> {
        let directories = self.directory_map();
        self.path_metadata
            .iter()
            .map(|entry| self.describe(&entry.path, Some(entry), &directories))
            .collect()
    }

    /// Every directory, explicit or implied by stored file paths, in path order
    pub fn list_directories(&self) -> Vec<PathInfo> {
        let directories = self.directory_map();
        directories
            .iter()
            .map(|(path, entry)| self.describe(path, *entry, &directories))
            .collect()
    }

    pub fn directory_count(&self) -> usize {
        self.directory_map().len()
    }

    /// Metadata paths grouped under their parent directory (`""` for top level)
    pub fn path_hierarchy(&self) -> BTreeMap<String, Vec<String>> {
        let mut hierarchy: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &self.path_metadata {
            hierarchy
                .entry(entry.parent().unwrap_or_default())
                .or_default()
                .push(entry.path.clone());
        }
        for children in hierarchy.values_mut() {
            children.sort();
        }
        hierarchy
    }

    /// Write the in-memory path metadata into the path metadata file
    ///
    /// With no path metadata left, the file is removed.
    pub fn save_path_metadata_file(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        let position = self
            .slots
            .iter()
            .position(|s| s.entry.file_type == PATH_METADATA_FILE_TYPE);

        if self.path_metadata.is_empty() {
            if let Some(position) = position {
                let slot = self.slots.remove(position);
                debug!(file_id = slot.entry.file_id, "Removed path metadata file");
                self.touch_content();
            }
            return Ok(());
        }

        let bytes = encode_path_metadata(&self.path_metadata)?;
        match position {
            Some(position) => {
                let slot = &mut self.slots[position];
                fill_metadata_file(&mut slot.entry, &bytes);
                slot.entry.file_version = slot.entry.file_version.wrapping_add(1);
                slot.data = DataSource::Memory(bytes);
                slot.on_disk = None;
            }
            None => {
                if self.file_by_path(PATH_METADATA_FILE_NAME).is_some() {
                    return Err(PackageError::InvalidPath {
                        path: PATH_METADATA_FILE_NAME.to_string(),
                        reason: "reserved for the path metadata file".to_string(),
                    });
                }
                let file_id = self.next_file_id.ok_or_else(|| {
                    PackageError::invalid("file_id", "every FileID up to u64::MAX is in use")
                })?;
                let mut entry = FileEntry::new(file_id);
                entry
                    .paths
                    .push(PathEntry::new(PATH_METADATA_FILE_NAME).with_mode(0o644));
                fill_metadata_file(&mut entry, &bytes);
                entry.validate()?;
                self.next_file_id = file_id.checked_add(1);
                debug!(file_id, "Created path metadata file");
                self.slots.push(EntrySlot {
                    entry,
                    data: DataSource::Memory(bytes),
                    on_disk: None,
                });
            }
        }
        info!(entries = self.path_metadata.len(), "Saved path metadata");
        self.touch_content();
        Ok(())
    }

    /// Reload path metadata from the path metadata file, discarding the
    /// in-memory copy
    pub fn load_path_metadata_file(&mut self) -> Result<()> {
        self.path_metadata = self.read_path_metadata_file()?;
        self.refresh_flags();
        Ok(())
    }

    pub(crate) fn read_path_metadata_file(&self) -> Result<Vec<PathMetadataEntry>> {
        let Some(slot) = self
            .slots
            .iter()
            .find(|s| s.entry.file_type == PATH_METADATA_FILE_TYPE)
        else {
            return Ok(Vec::new());
        };
        let bytes = self.read_file(slot.entry.file_id)?;
        let entries = decode_path_metadata(&bytes)?;
        debug!(entries = entries.len(), "Loaded path metadata");
        Ok(entries)
    }

    /// Special metadata entries are maintained by the package itself
    pub(crate) fn ensure_regular_file(&self, file_id: u64) -> Result<()> {
        match self.file_by_id(file_id) {
            Some(entry) if is_special_file_type(entry.file_type) => Err(PackageError::invalid(
                "file_id",
                format!(
                    "file {} is a special metadata file managed by the package",
                    file_id
                ),
            )),
            _ => Ok(()),
        }
    }
}
