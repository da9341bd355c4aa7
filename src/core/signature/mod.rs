//! Append-only signature chain
//!
//! A signed package ends with one or more signature blocks. Block `i` signs
//! every byte in `[0, offset_of(i))`: the header, all entries and data, the
//! index, the comment, and every earlier block. The bytes in front of the
//! first block are frozen once the first signature is added (the "sealed
//! prefix"), so the chain can only grow at the end or be truncated from some
//! index onwards.

pub mod keys;

pub use keys::{KeyRing, Signer, Verifier, X509Ed25519Key, X509Ed25519PublicKey};

use crate::codec::FieldReader;
use crate::error::{PackageError, Result};
use crate::header::HEADER_SIZE;
use std::ops::Range;
use tracing::{debug, info};

/// type, size, flags, timestamp, comment length
pub const SIGNATURE_FIXED_SIZE: usize = 18;

/// Flag bits 16-31 are reserved
pub const SIGNATURE_RESERVED_FLAGS: u32 = 0xFFFF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SignatureType {
    MlDsa = 1,
    SlhDsa = 2,
    Pgp = 3,
    X509 = 4,
}

impl SignatureType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(SignatureType::MlDsa),
            2 => Ok(SignatureType::SlhDsa),
            3 => Ok(SignatureType::Pgp),
            4 => Ok(SignatureType::X509),
            other => Err(PackageError::InvalidSignatureType(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SignatureType::MlDsa => "ML-DSA",
            SignatureType::SlhDsa => "SLH-DSA",
            SignatureType::Pgp => "PGP",
            SignatureType::X509 => "X.509",
        }
    }
}

impl std::fmt::Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub signature_type: SignatureType,
    pub flags: u32,
    /// Unix seconds
    pub timestamp: u32,
    pub comment: String,
    pub data: Vec<u8>,
}

impl SignatureBlock {
    pub fn new(signature_type: SignatureType, data: Vec<u8>, comment: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        SignatureBlock {
            signature_type,
            flags: 0,
            timestamp: now,
            comment: comment.into(),
            data,
        }
    }

    pub fn encoded_size(&self) -> usize {
        SIGNATURE_FIXED_SIZE + self.comment.len() + self.data.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.flags & SIGNATURE_RESERVED_FLAGS != 0 {
            return Err(PackageError::ReservedNotZero {
                structure: "Signature",
                field: "Flags",
                value: (self.flags & SIGNATURE_RESERVED_FLAGS) as u64,
            });
        }
        if self.data.is_empty() {
            return Err(PackageError::malformed(
                "Signature",
                "SignatureSize",
                "signature data must not be empty",
            ));
        }
        if self.data.len() > u32::MAX as usize {
            return Err(PackageError::malformed(
                "Signature",
                "SignatureSize",
                "signature data exceeds u32 range",
            ));
        }
        if self.comment.len() > u16::MAX as usize {
            return Err(PackageError::malformed(
                "Signature",
                "CommentLength",
                format!("comment is {} bytes, limit {}", self.comment.len(), u16::MAX),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut out = Vec::with_capacity(self.encoded_size());
        out.extend_from_slice(&(self.signature_type as u32).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(self.comment.as_bytes());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Decode one block from the front of `bytes`, returning it and its length
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = FieldReader::new(bytes, "Signature");
        let signature_type = SignatureType::from_u32(r.u32("SignatureType")?)?;
        let size = r.u32("SignatureSize")? as usize;
        let flags = r.u32("Flags")?;
        let timestamp = r.u32("Timestamp")?;
        let comment_len = r.u16("CommentLength")? as usize;

        if flags & SIGNATURE_RESERVED_FLAGS != 0 {
            return Err(PackageError::ReservedNotZero {
                structure: "Signature",
                field: "Flags",
                value: (flags & SIGNATURE_RESERVED_FLAGS) as u64,
            });
        }
        if size == 0 {
            return Err(PackageError::malformed(
                "Signature",
                "SignatureSize",
                "signature size must be non-zero",
            ));
        }

        let comment = std::str::from_utf8(r.bytes(comment_len, "Comment")?)
            .map_err(|e| PackageError::malformed("Signature", "Comment", e.to_string()))?
            .to_string();
        let data = r.bytes(size, "SignatureData")?.to_vec();

        Ok((
            SignatureBlock {
                signature_type,
                flags,
                timestamp,
                comment,
                data,
            },
            r.position(),
        ))
    }
}

/// Decode consecutive blocks until `bytes` is exhausted
pub fn decode_chain(bytes: &[u8]) -> Result<Vec<SignatureBlock>> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (block, used) = SignatureBlock::decode(&bytes[pos..])?;
        blocks.push(block);
        pos += used;
    }
    Ok(blocks)
}

/// Byte range signed by the block at `index`, given the sealed prefix length
/// and the encoded sizes of the blocks in chain order
pub fn coverage_range(prefix_len: u64, block_sizes: &[u64], index: usize) -> Option<Range<u64>> {
    if index >= block_sizes.len() {
        return None;
    }
    let end = prefix_len + block_sizes[..index].iter().sum::<u64>();
    Some(0..end)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    Invalid(String),
}

impl SignatureStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureStatus::Valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureReport {
    pub index: usize,
    pub signature_type: SignatureType,
    pub timestamp: u32,
    pub comment: String,
    pub status: SignatureStatus,
}

/// Sealed prefix plus the ordered signature blocks that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureChain {
    prefix: Vec<u8>,
    blocks: Vec<SignatureBlock>,
}

impl SignatureChain {
    /// Begin a chain over `prefix`, the complete serialized package up to
    /// where the first block will be written
    pub fn seal(prefix: Vec<u8>) -> Result<Self> {
        if prefix.len() < HEADER_SIZE {
            return Err(PackageError::malformed(
                "Signature",
                "SignatureOffset",
                format!("sealed prefix is {} bytes, shorter than the header", prefix.len()),
            ));
        }
        Ok(SignatureChain {
            prefix,
            blocks: Vec::new(),
        })
    }

    /// Split a whole package image at `signature_offset`
    pub fn from_package_bytes(bytes: &[u8], signature_offset: u64) -> Result<Self> {
        let offset = usize::try_from(signature_offset)
            .ok()
            .filter(|&o| o >= HEADER_SIZE && o < bytes.len())
            .ok_or(PackageError::OutOfBounds {
                structure: "Header",
                field: "SignatureOffset",
                offset: signature_offset,
                length: SIGNATURE_FIXED_SIZE as u64,
                limit: bytes.len() as u64,
            })?;
        let blocks = decode_chain(&bytes[offset..])?;
        debug!(count = blocks.len(), offset, "Decoded signature chain");
        Ok(SignatureChain {
            prefix: bytes[..offset].to_vec(),
            blocks,
        })
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn blocks(&self) -> &[SignatureBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// File offset of the first block
    pub fn signature_offset(&self) -> u64 {
        self.prefix.len() as u64
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.blocks.len() {
            return Err(PackageError::SignatureNotFound {
                index,
                count: self.blocks.len(),
            });
        }
        Ok(())
    }

    /// File offset of block `index`
    pub fn offset_of(&self, index: usize) -> Result<u64> {
        self.coverage(index).map(|range| range.end)
    }

    pub fn coverage(&self, index: usize) -> Result<Range<u64>> {
        let sizes: Vec<u64> = self
            .blocks
            .iter()
            .map(|b| b.encoded_size() as u64)
            .collect();
        coverage_range(self.prefix.len() as u64, &sizes, index).ok_or(
            PackageError::SignatureNotFound {
                index,
                count: self.blocks.len(),
            },
        )
    }

    /// Serialized prefix and all blocks
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total = self.prefix.len()
            + self
                .blocks
                .iter()
                .map(SignatureBlock::encoded_size)
                .sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.prefix);
        for block in &self.blocks {
            out.extend_from_slice(&block.encode()?);
        }
        Ok(out)
    }

    /// Bytes signed by block `index`
    pub fn signed_message(&self, index: usize) -> Result<Vec<u8>> {
        self.check_index(index)?;
        let mut out = self.prefix.clone();
        for block in &self.blocks[..index] {
            out.extend_from_slice(&block.encode()?);
        }
        Ok(out)
    }

    /// Sign everything written so far and append the new block
    pub fn append(&mut self, signer: &dyn Signer, comment: &str) -> Result<usize> {
        let message = self.to_bytes()?;
        let data = signer.sign(&message)?;
        let block = SignatureBlock::new(signer.signature_type(), data, comment);
        block.validate()?;
        self.blocks.push(block);
        let index = self.blocks.len() - 1;
        info!(
            index,
            scheme = %signer.signature_type(),
            covered = message.len(),
            "Appended signature"
        );
        Ok(index)
    }

    /// Remove block `index` and every block after it
    pub fn truncate(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let removed = self.blocks.len() - index;
        self.blocks.truncate(index);
        info!(index, removed, "Removed signatures");
        Ok(())
    }

    /// Check block `index` against one specific key
    pub fn validate_with_key(
        &self,
        index: usize,
        verifier: &dyn Verifier,
    ) -> Result<SignatureStatus> {
        self.check_index(index)?;
        let block = &self.blocks[index];
        if verifier.signature_type() != block.signature_type {
            return Ok(SignatureStatus::Invalid(format!(
                "key is for {}, signature is {}",
                verifier.signature_type(),
                block.signature_type
            )));
        }
        let message = self.signed_message(index)?;
        Ok(match verifier.verify(&message, &block.data) {
            Ok(()) => SignatureStatus::Valid,
            Err(e) => SignatureStatus::Invalid(e.to_string()),
        })
    }

    /// Check block `index` against every trusted key of its scheme
    ///
    /// A block no trusted key can verify is invalid.
    pub fn validate_index(&self, index: usize, keyring: &KeyRing) -> Result<SignatureStatus> {
        self.check_index(index)?;
        let block = &self.blocks[index];
        let message = self.signed_message(index)?;
        let mut last_failure = None;
        for verifier in keyring.verifiers_for(block.signature_type) {
            match verifier.verify(&message, &block.data) {
                Ok(()) => return Ok(SignatureStatus::Valid),
                Err(e) => last_failure = Some(e.to_string()),
            }
        }
        Ok(SignatureStatus::Invalid(last_failure.unwrap_or_else(|| {
            format!("no trusted {} key", block.signature_type)
        })))
    }

    fn report(&self, index: usize, status: SignatureStatus) -> SignatureReport {
        let block = &self.blocks[index];
        SignatureReport {
            index,
            signature_type: block.signature_type,
            timestamp: block.timestamp,
            comment: block.comment.clone(),
            status,
        }
    }

    /// Validate every block in chain order
    pub fn validate_all(&self, keyring: &KeyRing) -> Result<Vec<SignatureReport>> {
        (0..self.blocks.len())
            .map(|i| {
                self.validate_index(i, keyring)
                    .map(|status| self.report(i, status))
            })
            .collect()
    }

    /// Validate only the blocks of one scheme
    pub fn validate_type(
        &self,
        signature_type: SignatureType,
        keyring: &KeyRing,
    ) -> Result<Vec<SignatureReport>> {
        (0..self.blocks.len())
            .filter(|&i| self.blocks[i].signature_type == signature_type)
            .map(|i| {
                self.validate_index(i, keyring)
                    .map(|status| self.report(i, status))
            })
            .collect()
    }
}
