//! Sealed blob envelope.
//!
//! Anything secret that leaves memory (an exported key bundle, a private key
//! at rest) is wrapped in a SealedBlob: the ciphertext plus the metadata
//! needed to open it given the right key or password.

use serde::{Deserialize, Serialize};

use crate::crypto::{EncryptionKey, EncryptionNonce, Salt};
use crate::error::{Result, SealError};
use crate::password::TransportPassword;

/// Format identifier for sealed blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SealFormat {
    /// ChaCha20-Poly1305 with 256-bit key.
    ChaCha20Poly1305 = 1,
}

/// How the sealing key is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    /// The caller holds the key directly.
    Direct,
    /// Derived from a transport password and the blob's salt.
    TransportPassword { salt: Salt },
}

/// A sealed blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// Encryption algorithm used.
    pub format: SealFormat,

    pub key_source: KeySource,

    /// Nonce used for encryption (unique per seal).
    pub nonce: EncryptionNonce,

    /// The encrypted data (includes authentication tag).
    pub ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// Seal plaintext under a key held by the caller.
    pub fn seal_with_key(plaintext: &[u8], key: &EncryptionKey) -> Result<Self> {
        Self::seal(plaintext, key, KeySource::Direct)
    }

    /// Seal plaintext under a fresh salt and a transport password.
    pub fn seal_with_password(plaintext: &[u8], password: &TransportPassword) -> Result<Self> {
        let salt = Salt::generate();
        let key = EncryptionKey::derive_from_random_secret(password.expose().as_bytes(), &salt);
        Self::seal(plaintext, &key, KeySource::TransportPassword { salt })
    }

    fn seal(plaintext: &[u8], key: &EncryptionKey, key_source: KeySource) -> Result<Self> {
        let nonce = EncryptionNonce::generate();
        let ciphertext = key.encrypt(plaintext, &nonce)?;

        Ok(Self {
            format: SealFormat::ChaCha20Poly1305,
            key_source,
            nonce,
            ciphertext,
        })
    }

    /// Open a blob sealed with [`SealedBlob::seal_with_key`].
    pub fn open_with_key(&self, key: &EncryptionKey) -> Result<Vec<u8>> {
        match self.key_source {
            KeySource::Direct => self.open(key),
            KeySource::TransportPassword { .. } => Err(SealError::InvalidBundle(
                "blob is sealed with a transport password".into(),
            )),
        }
    }

    /// Open a blob sealed with [`SealedBlob::seal_with_password`].
    pub fn open_with_password(&self, password: &TransportPassword) -> Result<Vec<u8>> {
        match self.key_source {
            KeySource::TransportPassword { salt } => {
                let key = EncryptionKey::derive_from_random_secret(password.expose().as_bytes(), &salt);
                self.open(&key)
            }
            KeySource::Direct => Err(SealError::InvalidBundle(
                "blob is not sealed with a transport password".into(),
            )),
        }
    }

    fn open(&self, key: &EncryptionKey) -> Result<Vec<u8>> {
        match self.format {
            SealFormat::ChaCha20Poly1305 => key.decrypt(&self.ciphertext, &self.nonce),
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SealError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| SealError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_seal_roundtrip() {
        let key = EncryptionKey::generate();
        let blob = SealedBlob::seal_with_key(b"private key bytes", &key).unwrap();

        let bytes = blob.to_bytes().unwrap();
        let recovered = SealedBlob::from_bytes(&bytes).unwrap();
        assert_eq!(blob, recovered);
        assert_eq!(recovered.open_with_key(&key).unwrap(), b"private key bytes");
    }

    #[test]
    fn test_password_seal_roundtrip() {
        let password = TransportPassword::generate();
        let blob = SealedBlob::seal_with_password(b"bundle", &password).unwrap();
        assert_eq!(blob.open_with_password(&password).unwrap(), b"bundle");
    }

    #[test]
    fn test_wrong_password_fails() {
        let blob = SealedBlob::seal_with_password(b"bundle", &TransportPassword::generate()).unwrap();
        assert!(matches!(
            blob.open_with_password(&TransportPassword::generate()),
            Err(SealError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_key_source_must_match() {
        let key = EncryptionKey::generate();
        let blob = SealedBlob::seal_with_key(b"x", &key).unwrap();
        assert!(blob.open_with_password(&TransportPassword::generate()).is_err());

        let pw = TransportPassword::generate();
        let blob = SealedBlob::seal_with_password(b"x", &pw).unwrap();
        assert!(blob.open_with_key(&key).is_err());
    }

    #[test]
    fn test_same_plaintext_seals_differently() {
        let pw = TransportPassword::generate();
        let a = SealedBlob::seal_with_password(b"same", &pw).unwrap();
        let b = SealedBlob::seal_with_password(b"same", &pw).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut blob = SealedBlob::seal_with_key(b"payload", &key).unwrap();
        blob.ciphertext[0] ^= 0x01;
        assert!(blob.open_with_key(&key).is_err());
    }
}
