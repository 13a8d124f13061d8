//! Cryptographic primitives for Sigul PKI.
//!
//! Certificate keys are ECDSA P-256 (the curve every TLS stack in the
//! deployment accepts). Fingerprints are Blake3 over DER.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::CoreError;

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Blake3Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The subject public key of a certificate, as the raw bit string of its
/// SubjectPublicKeyInfo (an uncompressed EC point for P-256).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Key fingerprint used in listings and log lines.
    pub fn fingerprint(&self) -> Blake3Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"sigul-pki-key-v1:");
        hasher.update(&self.0);
        Blake3Hash(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.fingerprint().to_hex()[..16])
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A certificate keypair.
///
/// Held as its PKCS#8 PEM encoding, wiped on drop. The `rcgen` signing key
/// is rebuilt from it whenever a certificate has to be signed.
#[derive(Clone)]
pub struct Keypair {
    pkcs8_pem: Zeroizing<String>,
    public_key: PublicKey,
}

impl Keypair {
    /// Generate a new random P-256 keypair.
    pub fn generate() -> Result<Self, CoreError> {
        let key = rcgen::KeyPair::generate().map_err(|e| CoreError::KeyError(e.to_string()))?;
        Ok(Self::from_signing_key(&key))
    }

    /// Restore from a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self, CoreError> {
        let key = rcgen::KeyPair::from_pem(pem).map_err(|e| CoreError::KeyError(e.to_string()))?;
        Ok(Self::from_signing_key(&key))
    }

    fn from_signing_key(key: &rcgen::KeyPair) -> Self {
        Self {
            pkcs8_pem: Zeroizing::new(key.serialize_pem()),
            public_key: PublicKey(key.public_key_raw().to_vec()),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The PKCS#8 PEM private key. The returned buffer is wiped when dropped.
    pub fn to_pem(&self) -> Zeroizing<String> {
        self.pkcs8_pem.clone()
    }

    pub(crate) fn signing_key(&self) -> Result<rcgen::KeyPair, CoreError> {
        rcgen::KeyPair::from_pem(&self.pkcs8_pem).map_err(|e| CoreError::KeyError(e.to_string()))
    }
}

impl PartialEq for Keypair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Keypair {}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key)
    }
}
