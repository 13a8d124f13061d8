//! Secrets: the long-term store open password and single-use transport passwords.
//!
//! Both are wiped from memory on drop and never print their contents.

use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{Result, SealError};

/// Bytes of randomness in a transport password.
pub const TRANSPORT_PASSWORD_BYTES: usize = 32;

/// The long-term password that opens a principal's credential store.
///
/// Resolved once at the start of a run and passed explicitly.
#[derive(Clone)]
pub struct StorePassword(Zeroizing<String>);

impl StorePassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }

    /// Read a password the way it is kept in a password file: the first
    /// line, without the trailing newline.
    pub fn from_file_contents(contents: &str) -> Self {
        Self::new(contents.lines().next().unwrap_or_default())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for StorePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorePassword(..)")
    }
}

/// A random, single-use password protecting one exported key bundle.
#[derive(Clone)]
pub struct TransportPassword(Zeroizing<String>);

impl TransportPassword {
    /// Generate a fresh password from the thread RNG.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; TRANSPORT_PASSWORD_BYTES]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        Self(Zeroizing::new(hex::encode(&bytes[..])))
    }

    /// Parse a password read back from its file.
    pub fn from_file_contents(contents: &str) -> Result<Self> {
        let line = contents.lines().next().unwrap_or_default().trim();
        if line.len() != TRANSPORT_PASSWORD_BYTES * 2 || !line.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SealError::InvalidBundle("malformed transport password".into()));
        }
        Ok(Self(Zeroizing::new(line.to_string())))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Refuse a transport password equal to the store's open password.
    pub fn ensure_distinct_from(&self, store: &StorePassword) -> Result<()> {
        if self.expose() == store.expose() {
            return Err(SealError::PasswordReuse(
                "transport password equals the store open password".into(),
            ));
        }
        Ok(())
    }
}

impl PartialEq for TransportPassword {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for TransportPassword {}

impl fmt::Debug for TransportPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportPassword(..)")
    }
}
