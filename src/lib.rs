//! # nvpk-rs - NVPK package container
//!
//! An NVPK package is a single file holding many files, each described by a
//! self-contained entry record and followed by its data. Packages support:
//!
//! - **Per-file compression** (Zstd, LZ4, LZMA) with automatic selection
//! - **Deduplication** at raw, compressed and stored-byte stages
//! - **Encryption** with AES-256-GCM or a post-quantum KEM
//! - **Signature chains** where each signature covers every earlier byte
//! - **Atomic rewrites** (SafeWrite) and in-place appends (FastWrite)
//! - **Path metadata** with directory entries and property inheritance
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nvpk_rs::{AddFileOptions, CompressionChoice, Package, Result};
//!
//! # fn main() -> Result<()> {
//! let mut package = Package::new();
//! package.add_file("docs/readme.txt", b"Hello, World!", &AddFileOptions::new())?;
//! package.set_comment("nightly build")?;
//! package.write("bundle.nvpk", CompressionChoice::Unspecified, false)?;
//!
//! let package = Package::open_read_only("bundle.nvpk")?;
//! let content = package.read_file_by_path("docs/readme.txt")?;
//! assert_eq!(content, b"Hello, World!");
//! # Ok(())
//! # }
//! ```
//!
//! ## Signing
//!
//! ```rust,no_run
//! use nvpk_rs::{KeyRing, Package, Result, X509Ed25519Key};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let key = X509Ed25519Key::generate();
//! let mut package = Package::open("bundle.nvpk")?;
//! package.sign(&key, "release")?;
//! package.safe_write("bundle.nvpk")?;
//!
//! let ring = KeyRing::new().with(Arc::new(key.public_key()));
//! for report in package.validate_all_signatures(&ring)? {
//!     println!("{} {:?}", report.index, report.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    buffer_pool, classify, codec, comment, compression, config, context, dedup, encryption,
    entry, error, header, index, io, package, path_metadata, pipeline, signature, validation,
    writer,
};

pub use crate::core::{
    AddFileOptions, BufferPool, BufferPoolConfig, CompressionChoice, CompressionType, Context,
    DedupConfig, DedupStage, DedupStats, DirectoryDetails, EncryptionType, ErrorKind,
    FastWriteFallback, FileClassifier, FileEntry, FileTypeTag, Header, KeyEncapsulation,
    KeyProvider, KeyRing, NullClassifier, Package, PackageConfig, PackageError, PackageInfo,
    PathEntry, PathFileSystem, PathInfo, PathInheritance, PathMetadataEntry, PathMetadataType,
    Result, SignatureBlock, SignatureReport, SignatureStatus, SignatureType, Signer, Verifier,
    WriteStrategy, X509Ed25519Key, X509Ed25519PublicKey,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
