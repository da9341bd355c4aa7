//! Disk I/O for package files

use crate::buffer_pool::BufferPool;
use crate::context::Context;
use crate::error::{PackageError, Result};
use crate::header::{Header, HEADER_SIZE};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes moved per read when copying payload ranges
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Open handle on a package file
pub struct PackageFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl PackageFile {
    /// Open an existing package file
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PackageError::PackageNotFound(path.to_path_buf())
                } else {
                    PackageError::io_at("open", path, None, e)
                }
            })?;
        Ok(PackageFile {
            file,
            path: path.to_path_buf(),
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| PackageError::io_at("stat", &self.path, None, e))
    }

    /// Parse and structurally validate the header against the file length
    pub fn read_header(&mut self) -> Result<Header> {
        let len = self.len()?;
        // A short file still reports a magic mismatch before truncation
        let bytes = self.read_at(0, len.min(HEADER_SIZE as u64) as usize)?;
        let header = Header::from_bytes(&bytes)?;
        header.validate_bounds(len)?;
        Ok(header)
    }

    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        self.write_at(0, &header.to_bytes())
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut buffer))
            .map_err(|e| PackageError::io_at("read", &self.path, Some(offset), e))?;
        Ok(buffer)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| PackageError::io_at("write", &self.path, Some(offset), e))
    }

    /// Stream `[offset, offset + len)` into `sink` through pooled buffers
    pub fn copy_range(
        &mut self,
        offset: u64,
        len: u64,
        pool: &BufferPool,
        ctx: &Context,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| PackageError::io_at("seek", &self.path, Some(offset), e))?;
        let mut remaining = len;
        let mut pos = offset;
        while remaining > 0 {
            ctx.check("copy")?;
            let step = remaining.min(COPY_CHUNK_SIZE as u64) as usize;
            let mut buffer = pool.acquire(step)?;
            buffer.resize(step, 0);
            self.file
                .read_exact(&mut buffer[..step])
                .map_err(|e| PackageError::io_at("read", &self.path, Some(pos), e))?;
            sink(&buffer[..step])?;
            remaining -= step as u64;
            pos += step as u64;
        }
        Ok(())
    }

    /// CRC32 of `[start, end)`
    pub fn crc32_range(
        &mut self,
        start: u64,
        end: u64,
        pool: &BufferPool,
        ctx: &Context,
    ) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        self.copy_range(start, end.saturating_sub(start), pool, ctx, &mut |chunk| {
            hasher.update(chunk);
            Ok(())
        })?;
        Ok(hasher.finalize())
    }

    /// Map the whole file read-only
    pub fn map(&self) -> Result<Mmap> {
        // SAFETY: the mapping is read-only and dropped before this package
        // writes to the file again
        unsafe { Mmap::map(&self.file) }
            .map_err(|e| PackageError::io_at("mmap", &self.path, None, e))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| PackageError::io_at("sync", &self.path, None, e))
    }
}

/// fsync the directory holding `path` so a rename into it is durable
pub fn sync_parent_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| PackageError::io_at("sync directory", parent, None, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
