//! RSA-OAEP (SHA-512) body sealing
//!
//! A whole serialized body is sealed, not individual fields. OAEP can only
//! take `key_size - 2 * 64 - 2` bytes per operation, so the plaintext is cut
//! into chunks of that size and the ciphertext blocks (each exactly
//! `key_size` bytes) are concatenated.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use std::fmt;
use std::path::Path;

/// Header marking a sealed HTTP body
pub const ENCRYPTION_HEADER: &str = "content-encryption";
pub const ENCRYPTION_SCHEME: &str = "rsa-oaep-sha512";

const SHA512_LEN: usize = 64;

#[derive(Debug)]
pub enum EnvelopeError {
    /// Key file unreadable or not a PEM RSA key
    KeyLoad(String),
    Encrypt(String),
    /// Ciphertext malformed or sealed for another key
    Decrypt(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::KeyLoad(reason) => write!(f, "failed to load RSA key: {}", reason),
            EnvelopeError::Encrypt(reason) => write!(f, "encryption failed: {}", reason),
            EnvelopeError::Decrypt(reason) => write!(f, "decryption failed: {}", reason),
        }
    }
}

impl std::error::Error for EnvelopeError {}

fn chunk_len(key_size: usize) -> Result<usize, EnvelopeError> {
    key_size
        .checked_sub(2 * SHA512_LEN + 2)
        .filter(|len| *len > 0)
        .ok_or_else(|| {
            EnvelopeError::KeyLoad(format!(
                "{}-bit key is too small for OAEP with SHA-512",
                key_size * 8
            ))
        })
}

fn read_pem(path: &Path) -> Result<String, EnvelopeError> {
    std::fs::read_to_string(path)
        .map_err(|e| EnvelopeError::KeyLoad(format!("{}: {}", path.display(), e)))
}

/// Agent side: encrypt-only
#[derive(Debug, Clone)]
pub struct Sealer {
    key: RsaPublicKey,
}

impl Sealer {
    pub fn new(key: RsaPublicKey) -> Result<Self, EnvelopeError> {
        chunk_len(key.size())?;
        Ok(Sealer { key })
    }

    /// Accepts SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`)
    pub fn from_pem(pem: &str) -> Result<Self, EnvelopeError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| EnvelopeError::KeyLoad(e.to_string()))?;
        Self::new(key)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EnvelopeError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let key_size = self.key.size();
        let chunk = chunk_len(key_size)?;
        let mut rng = rand::thread_rng();
        let mut sealed = Vec::with_capacity((plaintext.len() / chunk + 1) * key_size);

        // An empty body still produces one block so the receiver sees a
        // well-formed envelope.
        if plaintext.is_empty() {
            let block = self
                .key
                .encrypt(&mut rng, Oaep::new::<Sha512>(), &[])
                .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
            return Ok(block);
        }

        for piece in plaintext.chunks(chunk) {
            let block = self
                .key
                .encrypt(&mut rng, Oaep::new::<Sha512>(), piece)
                .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
            sealed.extend_from_slice(&block);
        }
        Ok(sealed)
    }
}

/// Server side: decrypt-only
#[derive(Clone)]
pub struct Opener {
    key: RsaPrivateKey,
}

impl fmt::Debug for Opener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opener")
            .field("bits", &(self.key.size() * 8))
            .finish_non_exhaustive()
    }
}

impl Opener {
    pub fn new(key: RsaPrivateKey) -> Result<Self, EnvelopeError> {
        chunk_len(key.size())?;
        Ok(Opener { key })
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`)
    pub fn from_pem(pem: &str) -> Result<Self, EnvelopeError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| EnvelopeError::KeyLoad(e.to_string()))?;
        Self::new(key)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EnvelopeError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    /// Matching encrypt-only half
    pub fn sealer(&self) -> Sealer {
        Sealer {
            key: self.key.to_public_key(),
        }
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let key_size = self.key.size();
        if sealed.is_empty() || sealed.len() % key_size != 0 {
            return Err(EnvelopeError::Decrypt(format!(
                "ciphertext length {} is not a multiple of {}",
                sealed.len(),
                key_size
            )));
        }

        let mut plaintext = Vec::with_capacity(sealed.len());
        for block in sealed.chunks(key_size) {
            let piece = self
                .key
                .decrypt(Oaep::new::<Sha512>(), block)
                .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;
            plaintext.extend_from_slice(&piece);
        }
        Ok(plaintext)
    }
}
