//! Signing and verification key seams, plus the built-in Ed25519 key

use super::SignatureType;
use crate::error::{PackageError, Result};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::sync::Arc;

/// Produces signature bytes for one scheme
pub trait Signer: Send + Sync {
    fn signature_type(&self) -> SignatureType;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Checks signature bytes for one scheme
pub trait Verifier: Send + Sync {
    fn signature_type(&self) -> SignatureType;

    /// `Ok(())` only when `signature` is valid for `message` under this key
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()>;
}

/// Trusted verification keys
#[derive(Clone, Default)]
pub struct KeyRing {
    verifiers: Vec<Arc<dyn Verifier>>,
}

impl KeyRing {
    pub fn new() -> Self {
        KeyRing::default()
    }

    pub fn add(&mut self, verifier: Arc<dyn Verifier>) {
        self.verifiers.push(verifier);
    }

    pub fn with(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.add(verifier);
        self
    }

    pub fn len(&self) -> usize {
        self.verifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    pub fn verifiers_for(
        &self,
        signature_type: SignatureType,
    ) -> impl Iterator<Item = &Arc<dyn Verifier>> {
        self.verifiers
            .iter()
            .filter(move |v| v.signature_type() == signature_type)
    }
}

/// Ed25519 key (RFC 8410) used for X.509-scheme signature blocks
///
/// Certificate handling belongs to whoever provisions the key; the block
/// stores the raw 64-byte Ed25519 signature.
pub struct X509Ed25519Key {
    signing_key: SigningKey,
}

impl X509Ed25519Key {
    pub fn generate() -> Self {
        X509Ed25519Key {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        X509Ed25519Key {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key(&self) -> X509Ed25519PublicKey {
        X509Ed25519PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }
}

impl Signer for X509Ed25519Key {
    fn signature_type(&self) -> SignatureType {
        SignatureType::X509
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl Verifier for X509Ed25519Key {
    fn signature_type(&self) -> SignatureType {
        SignatureType::X509
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        self.public_key().verify(message, signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X509Ed25519PublicKey {
    verifying_key: VerifyingKey,
}

impl X509Ed25519PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| PackageError::Key(format!("invalid Ed25519 public key: {}", e)))?;
        Ok(X509Ed25519PublicKey { verifying_key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

impl Verifier for X509Ed25519PublicKey {
    fn signature_type(&self) -> SignatureType {
        SignatureType::X509
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|e| PackageError::Key(format!("malformed Ed25519 signature: {}", e)))?;
        self.verifying_key
            .verify_strict(message, &signature)
            .map_err(|e| PackageError::Key(format!("Ed25519 verification failed: {}", e)))
    }
}
