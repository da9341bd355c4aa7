//! Per-file payload encryption
//!
//! **Schemes** (code stored in each FileEntry):
//! - `None` (0)
//! - `Aes256Gcm` (1): `[nonce: 12][ciphertext][tag: 16]` under a caller key
//! - `QuantumSafe` (2): `[kem_ct_len: u16][kem_ct][nonce: 12][ciphertext][tag: 16]`.
//!   A fresh data key is encapsulated per payload through a
//!   [`KeyEncapsulation`] provider; only the KEM ciphertext is stored.
//!
//! Keys never enter the package. They are supplied through [`KeyProvider`].

use crate::error::{PackageError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Encryption key (32 bytes for AES-256)
pub type EncryptionKey = [u8; 32];

/// Nonce size for AES-GCM (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Overhead added by AES-GCM (nonce + tag)
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EncryptionType {
    #[default]
    None = 0,
    Aes256Gcm = 1,
    QuantumSafe = 2,
}

impl EncryptionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EncryptionType::None),
            1 => Some(EncryptionType::Aes256Gcm),
            2 => Some(EncryptionType::QuantumSafe),
            _ => None,
        }
    }
}

/// Post-quantum key encapsulation mechanism (for example ML-KEM)
pub trait KeyEncapsulation: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// Produce a fresh shared secret and the ciphertext that carries it
    fn encapsulate(&self) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Recover the shared secret from a stored ciphertext
    fn decapsulate(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Key material available to a package session
#[derive(Clone, Default)]
pub struct KeyProvider {
    aes_key: Option<EncryptionKey>,
    kem: Option<Arc<dyn KeyEncapsulation>>,
}

impl fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProvider")
            .field("aes_key", &self.aes_key.map(|_| "<redacted>"))
            .field("kem", &self.kem.as_ref().map(|k| k.algorithm()))
            .finish()
    }
}

impl KeyProvider {
    pub fn new() -> Self {
        KeyProvider::default()
    }

    pub fn with_aes_key(mut self, key: EncryptionKey) -> Self {
        self.aes_key = Some(key);
        self
    }

    pub fn with_kem(mut self, kem: Arc<dyn KeyEncapsulation>) -> Self {
        self.kem = Some(kem);
        self
    }

    /// Generate a random AES-256 key
    pub fn generate_key() -> EncryptionKey {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    pub fn supports(&self, encryption: EncryptionType) -> bool {
        match encryption {
            EncryptionType::None => true,
            EncryptionType::Aes256Gcm => self.aes_key.is_some(),
            EncryptionType::QuantumSafe => self.kem.is_some(),
        }
    }

    fn aes_key(&self) -> Result<&EncryptionKey> {
        self.aes_key
            .as_ref()
            .ok_or_else(|| PackageError::Key("no AES-256-GCM key configured".to_string()))
    }

    fn kem(&self) -> Result<&Arc<dyn KeyEncapsulation>> {
        self.kem
            .as_ref()
            .ok_or_else(|| PackageError::Key("no key encapsulation provider configured".to_string()))
    }

    /// Encrypt `data` under `encryption`
    pub fn encrypt(&self, data: &[u8], encryption: EncryptionType) -> Result<Vec<u8>> {
        match encryption {
            EncryptionType::None => Ok(data.to_vec()),
            EncryptionType::Aes256Gcm => encrypt(data, self.aes_key()?),
            EncryptionType::QuantumSafe => {
                let kem = self.kem()?;
                let (secret, kem_ct) = kem.encapsulate()?;
                let kem_len = u16::try_from(kem_ct.len()).map_err(|_| {
                    PackageError::Encryption(format!(
                        "{} ciphertext of {} bytes is too large",
                        kem.algorithm(),
                        kem_ct.len()
                    ))
                })?;
                let sealed = encrypt(data, &derive_data_key(&secret))?;
                let mut out = Vec::with_capacity(2 + kem_ct.len() + sealed.len());
                out.extend_from_slice(&kem_len.to_le_bytes());
                out.extend_from_slice(&kem_ct);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
        }
    }

    /// Inverse of [`KeyProvider::encrypt`]
    pub fn decrypt(&self, data: &[u8], encryption: EncryptionType) -> Result<Vec<u8>> {
        match encryption {
            EncryptionType::None => Ok(data.to_vec()),
            EncryptionType::Aes256Gcm => decrypt(data, self.aes_key()?),
            EncryptionType::QuantumSafe => {
                let kem = self.kem()?;
                if data.len() < 2 {
                    return Err(PackageError::Encryption(
                        "quantum-safe payload too short".to_string(),
                    ));
                }
                let kem_len = u16::from_le_bytes([data[0], data[1]]) as usize;
                let rest = &data[2..];
                if rest.len() < kem_len {
                    return Err(PackageError::Encryption(
                        "quantum-safe payload truncated inside KEM ciphertext".to_string(),
                    ));
                }
                let (kem_ct, sealed) = rest.split_at(kem_len);
                let secret = kem.decapsulate(kem_ct)?;
                decrypt(sealed, &derive_data_key(&secret))
            }
        }
    }
}

/// Hash a KEM shared secret down to an AES-256 key
fn derive_data_key(secret: &[u8]) -> EncryptionKey {
    let mut hasher = Sha256::new();
    hasher.update(b"nvpk quantum-safe data key");
    hasher.update(secret);
    hasher.finalize().into()
}

/// Encrypt data using AES-256-GCM
///
/// Returns encrypted data with format: [nonce][ciphertext][tag]
pub fn encrypt(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| PackageError::Encryption(format!("AES-256-GCM encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt data using AES-256-GCM
///
/// Expects data in format: [nonce][ciphertext][tag]
pub fn decrypt(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if data.len() < ENCRYPTION_OVERHEAD {
        return Err(PackageError::Encryption(
            "encrypted data too short".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    let ciphertext = &data[NONCE_SIZE..];

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| PackageError::Encryption(format!("AES-256-GCM decryption failed: {}", e)))
}
