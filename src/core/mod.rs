//! NVPK core: the binary format, the package model and its engines
//!
//! - [`header`], [`entry`], [`index`], [`comment`] - binary records and their codecs
//! - [`package`], [`pipeline`], [`writer`] - the in-memory package, the content
//!   pipeline and the two write strategies
//! - [`path_metadata`] - per-path properties, directories and inheritance,
//!   persisted in a special metadata entry
//! - [`compression`] - codecs, automatic selection and the streaming engine
//! - [`dedup`] - raw, processed and final stage content deduplication
//! - [`encryption`] - AES-256-GCM and KEM-wrapped payload encryption
//! - [`signature`] - the append-only signature chain and key traits
//! - [`buffer_pool`] - size-classed, LRU-evicting buffer pool for codec workers
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Header (112 bytes)                       │
//! ├──────────────────────────────────────────┤
//! │ FileEntry 1 │ data 1                     │
//! │ FileEntry 2 │ (reference, no data)       │
//! │ ...                                      │
//! ├──────────────────────────────────────────┤
//! │ File index   (Header.IndexStart/Size)    │
//! │ Comment      (Header.CommentStart/Size)  │
//! ├──────────────────────────────────────────┤
//! │ Signature blocks (Header.SignatureOffset)│
//! └──────────────────────────────────────────┘
//! ```

pub mod buffer_pool;
pub mod classify;
pub mod codec;
pub mod comment;
pub mod compression;
pub mod config;
pub mod context;
pub mod dedup;
pub mod encryption;
pub mod entry;
pub mod error;
pub mod header;
pub mod index;
pub mod io;
pub mod package;
pub mod path_metadata;
pub mod pipeline;
pub mod signature;
pub mod validation;
pub mod writer;

pub use buffer_pool::{BufferPool, BufferPoolConfig, BufferPoolStats};
pub use classify::{FileClassifier, FileTypeTag, NullClassifier};
pub use compression::{select_compression, CompressionType, StreamConfig, StreamingCompressor};
pub use config::{CompressionChoice, FastWriteFallback, PackageConfig};
pub use context::Context;
pub use dedup::{DedupConfig, DedupStage, DedupStats};
pub use encryption::{EncryptionType, KeyEncapsulation, KeyProvider};
pub use entry::{FileEntry, HashType, PathEntry};
pub use error::{ErrorKind, PackageError, Result};
pub use header::{Header, HEADER_SIZE, MAGIC};
pub use package::{Package, PackageInfo};
pub use path_metadata::{
    DirectoryDetails, PathFileSystem, PathInfo, PathInheritance, PathMetadataEntry,
    PathMetadataType,
};
pub use pipeline::AddFileOptions;
pub use signature::{
    KeyRing, SignatureBlock, SignatureReport, SignatureStatus, SignatureType, Signer, Verifier,
    X509Ed25519Key, X509Ed25519PublicKey,
};
pub use writer::WriteStrategy;
