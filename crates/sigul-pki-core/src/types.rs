//! Strong type definitions for Sigul PKI.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Maximum length of a fully-qualified domain name.
pub const MAX_FQDN_LEN: usize = 253;

/// Maximum length of a single DNS label.
pub const MAX_LABEL_LEN: usize = 63;

/// A 16-byte certificate serial number.
///
/// Serials are random so that a forced re-provisioning never reuses one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Serial(pub [u8; 16]);

impl Serial {
    /// Generate a new random serial.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Positive, and a full 16 bytes once DER-encoded.
        bytes[0] = (bytes[0] & 0x7f) | 0x40;
        Self(bytes)
    }

    /// Read the content octets of a DER INTEGER serial.
    ///
    /// Leading zero octets are dropped; shorter serials are left-padded.
    pub fn from_der_integer(raw: &[u8]) -> Option<Self> {
        let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
        let digits = &raw[start..];
        if digits.len() > 16 {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes[16 - digits.len()..].copy_from_slice(digits);
        Some(Self(bytes))
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self.to_hex())
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The name under which a certificate is filed in a credential store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nickname(String);

impl Nickname {
    /// Create a nickname, rejecting empty names and control characters.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.is_empty()
            || name.len() > 64
            || name.chars().any(|c| c.is_control() || c == ',' || c == '/')
        {
            return Err(CoreError::InvalidNickname(name));
        }
        Ok(Self(name))
    }

    /// Build a nickname from a compile-time constant.
    ///
    /// Only for the well-known names defined in this workspace.
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nickname({})", self.0)
    }
}

impl fmt::Display for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Nickname {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Nickname {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Nickname> for String {
    fn from(n: Nickname) -> Self {
        n.0
    }
}

impl AsRef<str> for Nickname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A fully-qualified domain name identifying one principal.
///
/// The name is kept exactly as configured; comparisons are byte-for-byte so
/// that subject and SAN checks match the configured value exactly.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fqdn(String);

impl Fqdn {
    /// Parse and validate a host name.
    ///
    /// Accepts single-label names (container network aliases such as
    /// `sigul-bridge`) as well as dotted names. A trailing dot is rejected.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        let invalid = |reason| CoreError::InvalidFqdn {
            value: value.clone(),
            reason,
        };

        if value.is_empty() {
            return Err(invalid("empty"));
        }
        if value.len() > MAX_FQDN_LEN {
            return Err(invalid("longer than 253 bytes"));
        }
        for label in value.split('.') {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(invalid("label longer than 63 bytes"));
            }
            if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
                return Err(invalid("label contains characters other than letters, digits and '-'"));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(invalid("label starts or ends with '-'"));
            }
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fqdn({})", self.0)
    }
}

impl fmt::Display for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fqdn {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Fqdn {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Fqdn> for String {
    fn from(f: Fqdn) -> Self {
        f.0
    }
}

/// A certificate validity period in calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ValidityMonths(u32);

impl ValidityMonths {
    /// Upper bound accepted from configuration (50 years).
    pub const MAX: u32 = 600;

    pub fn new(months: u32) -> Result<Self, CoreError> {
        if months == 0 {
            return Err(CoreError::InvalidValidity("validity must be at least one month".into()));
        }
        if months > Self::MAX {
            return Err(CoreError::InvalidValidity(format!(
                "{months} months exceeds the maximum of {}",
                Self::MAX
            )));
        }
        Ok(Self(months))
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for ValidityMonths {
    type Error = CoreError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ValidityMonths> for u32 {
    fn from(v: ValidityMonths) -> Self {
        v.0
    }
}
