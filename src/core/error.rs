use std::path::PathBuf;
use thiserror::Error;

/// Broad classification of a [`PackageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad magic, unsupported version, non-zero reserved field, malformed record
    Format,
    /// Offset/length out of range, invalid type code, invalid argument
    Validation,
    /// Missing file, entry or signature
    NotFound,
    /// Filesystem failure
    Io,
    /// Cancellation or deadline
    Context,
    /// Signature or key mismatch, trust failure
    Security,
    /// Checksum mismatch, inconsistent index, interrupted write
    Corruption,
    /// Mutation of a signed or read-only package
    Immutability,
    /// Compression or decompression failure
    Compression,
    /// Encryption or decryption failure
    Encryption,
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Magic mismatch: found 0x{found:08X}, expected 0x{expected:08X}")]
    InvalidMagic { found: u32, expected: u32 },

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("{structure}.{field} is reserved and must be zero (found {value:#x})")]
    ReservedNotZero {
        structure: &'static str,
        field: &'static str,
        value: u64,
    },

    #[error("Malformed {structure}.{field}: {reason}")]
    Malformed {
        structure: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("{structure}.{field} out of bounds: offset {offset} + length {length} exceeds {limit}")]
    OutOfBounds {
        structure: &'static str,
        field: &'static str,
        offset: u64,
        length: u64,
        limit: u64,
    },

    #[error("Invalid compression type code: {0}")]
    InvalidCompressionType(u8),

    #[error("Invalid encryption type code: {0}")]
    InvalidEncryptionType(u8),

    #[error("Invalid signature type code: {0}")]
    InvalidSignatureType(u32),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("FastWrite unavailable: {0}")]
    FastWriteUnavailable(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Package file not found: {0}")]
    PackageNotFound(PathBuf),

    #[error("Signature index {index} not found (package has {count} signatures)")]
    SignatureNotFound { index: usize, count: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error during {operation} on {path:?}{}: {source}", offset_suffix(.offset))]
    IoAt {
        operation: &'static str,
        path: PathBuf,
        offset: Option<u64>,
        #[source]
        source: std::io::Error,
    },

    #[error("Buffer pool exhausted: {requested} bytes requested, {in_use} in use, limit {limit}")]
    BufferPoolExhausted {
        requested: usize,
        in_use: usize,
        limit: usize,
    },

    #[error("Operation '{0}' was cancelled")]
    Cancelled(&'static str),

    #[error("Operation '{0}' exceeded its deadline")]
    DeadlineExceeded(&'static str),

    #[error("Signature {index} is invalid: {reason}")]
    SignatureInvalid { index: usize, reason: String },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Checksum mismatch in {what}: expected {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        what: String,
        expected: u32,
        actual: u32,
    },

    #[error("Inconsistent index: {0}")]
    InconsistentIndex(String),

    #[error("Package was left inconsistent by an interrupted in-place write; repair it before use")]
    IncompleteWrite,

    #[error("Package is signed; clear its signatures before modifying it")]
    SignedPackage,

    #[error("Package is open read-only")]
    ReadOnly,

    #[error("{algorithm} compression failed: {message}")]
    Compression {
        algorithm: &'static str,
        message: String,
    },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PackageError {
    /// Kind of this error, for callers that dispatch on the taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackageError::InvalidMagic { .. }
            | PackageError::UnsupportedVersion(_)
            | PackageError::ReservedNotZero { .. }
            | PackageError::Malformed { .. } => ErrorKind::Format,

            PackageError::OutOfBounds { .. }
            | PackageError::InvalidCompressionType(_)
            | PackageError::InvalidEncryptionType(_)
            | PackageError::InvalidSignatureType(_)
            | PackageError::InvalidPath { .. }
            | PackageError::InvalidArgument { .. }
            | PackageError::FastWriteUnavailable(_)
            | PackageError::Config(_) => ErrorKind::Validation,

            PackageError::FileNotFound(_)
            | PackageError::PackageNotFound(_)
            | PackageError::SignatureNotFound { .. } => ErrorKind::NotFound,

            PackageError::Io(_)
            | PackageError::IoAt { .. }
            | PackageError::BufferPoolExhausted { .. } => ErrorKind::Io,

            PackageError::Cancelled(_) | PackageError::DeadlineExceeded(_) => ErrorKind::Context,

            PackageError::SignatureInvalid { .. } | PackageError::Key(_) => ErrorKind::Security,

            PackageError::ChecksumMismatch { .. }
            | PackageError::InconsistentIndex(_)
            | PackageError::IncompleteWrite => ErrorKind::Corruption,

            PackageError::SignedPackage | PackageError::ReadOnly => ErrorKind::Immutability,

            PackageError::Compression { .. } => ErrorKind::Compression,

            PackageError::Encryption(_) => ErrorKind::Encryption,
        }
    }

    /// Wrap an I/O error with the operation, path and offset it happened at
    pub(crate) fn io_at(
        operation: &'static str,
        path: impl Into<PathBuf>,
        offset: Option<u64>,
        source: std::io::Error,
    ) -> Self {
        PackageError::IoAt {
            operation,
            path: path.into(),
            offset,
            source,
        }
    }

    pub(crate) fn malformed(
        structure: &'static str,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        PackageError::Malformed {
            structure,
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        PackageError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }
}

fn offset_suffix(offset: &Option<u64>) -> String {
    match offset {
        Some(o) => format!(" at offset {}", o),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, PackageError>;
