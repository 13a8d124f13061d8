//! Key bundles: a leaf certificate together with its private key.
//!
//! A bundle only exists in plaintext inside a process. On disk it is always
//! a [`SealedBundle`], sealed under a single-use transport password.

use bytes::Bytes;
use ciborium::value::Value;
use zeroize::Zeroizing;

use sigul_pki_core::{Certificate, Keypair, Nickname};

use crate::envelope::SealedBlob;
use crate::error::{Result, SealError};
use crate::password::TransportPassword;

mod keys {
    pub const NICKNAME: u64 = 0;
    pub const CERTIFICATE: u64 = 1;
    pub const PRIVATE_KEY: u64 = 2;
}

/// A certificate and the private key it certifies.
pub struct KeyBundle {
    nickname: Nickname,
    certificate: Certificate,
    private_key: Zeroizing<String>,
}

impl KeyBundle {
    /// Build a bundle, refusing a key that does not match the certificate.
    pub fn new(nickname: Nickname, certificate: Certificate, keypair: &Keypair) -> Result<Self> {
        if keypair.public_key() != certificate.public_key() {
            return Err(SealError::InvalidBundle(format!(
                "private key does not match certificate {nickname}"
            )));
        }
        Ok(Self {
            nickname,
            certificate,
            private_key: keypair.to_pem(),
        })
    }

    pub fn nickname(&self) -> &Nickname {
        &self.nickname
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Restore the signing keypair.
    pub fn keypair(&self) -> Result<Keypair> {
        Ok(Keypair::from_pem(&self.private_key)?)
    }

    /// Seal under a transport password.
    pub fn seal(&self, password: &TransportPassword) -> Result<SealedBundle> {
        let plaintext = self.encode()?;
        let blob = SealedBlob::seal_with_password(&plaintext, password)?;
        Ok(SealedBundle(Bytes::from(blob.to_bytes()?)))
    }

    fn encode(&self) -> Result<Zeroizing<Vec<u8>>> {
        let value = Value::Map(vec![
            (Value::Integer(keys::NICKNAME.into()), Value::Text(self.nickname.to_string())),
            (
                Value::Integer(keys::CERTIFICATE.into()),
                Value::Bytes(self.certificate.der().to_vec()),
            ),
            (
                Value::Integer(keys::PRIVATE_KEY.into()),
                Value::Bytes(self.private_key.as_bytes().to_vec()),
            ),
        ]);
        let mut buf = Zeroizing::new(Vec::new());
        ciborium::into_writer(&value, &mut *buf)
            .map_err(|e| SealError::SerializationError(e.to_string()))?;
        scrub(value);
        Ok(buf)
    }

    fn decode(plaintext: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(plaintext)
            .map_err(|e| SealError::InvalidBundle(e.to_string()))?;
        let Value::Map(mut entries) = value else {
            return Err(SealError::InvalidBundle("expected map".into()));
        };

        let mut take = |key: u64| -> Result<Value> {
            let index = entries
                .iter()
                .position(|(k, _)| matches!(k, Value::Integer(i) if i128::from(*i) == key as i128))
                .ok_or_else(|| SealError::InvalidBundle(format!("missing field {key}")))?;
            Ok(entries.swap_remove(index).1)
        };

        let nickname = match take(keys::NICKNAME)? {
            Value::Text(s) => Nickname::new(s)?,
            _ => return Err(SealError::InvalidBundle("invalid nickname".into())),
        };
        let certificate = match take(keys::CERTIFICATE)? {
            Value::Bytes(b) => Certificate::from_der(b)?,
            _ => return Err(SealError::InvalidBundle("invalid certificate".into())),
        };
        let private_key = match take(keys::PRIVATE_KEY)? {
            Value::Bytes(b) => Zeroizing::new(
                String::from_utf8(b).map_err(|e| {
                    drop(Zeroizing::new(e.into_bytes()));
                    SealError::InvalidBundle("private key is not PEM".into())
                })?,
            ),
            _ => return Err(SealError::InvalidBundle("invalid private key".into())),
        };

        let keypair = Keypair::from_pem(&private_key)?;
        Self::new(nickname, certificate, &keypair)
    }
}

/// Wipe byte strings held in a CBOR value before it is dropped.
fn scrub(value: Value) {
    if let Value::Map(entries) = value {
        for (_, v) in entries {
            if let Value::Bytes(b) = v {
                drop(Zeroizing::new(b));
            }
        }
    }
}

impl std::fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundle")
            .field("nickname", &self.nickname)
            .field("serial", &self.certificate.serial())
            .finish_non_exhaustive()
    }
}

/// A key bundle sealed under a transport password, as written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBundle(Bytes);

impl SealedBundle {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Open with the transport password it was sealed under.
    pub fn open(&self, password: &TransportPassword) -> Result<KeyBundle> {
        let blob = SealedBlob::from_bytes(&self.0)?;
        let plaintext = Zeroizing::new(blob.open_with_password(password)?);
        KeyBundle::decode(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigul_pki_core::{CertificateBuilder, DistinguishedName, ExtendedKeyUsage, ValidityMonths};

    fn leaf() -> (Certificate, Keypair) {
        let ca_key = Keypair::generate().unwrap();
        let ca = CertificateBuilder::new(DistinguishedName::new("Sigul CA"))
            .validity(ValidityMonths::new(120).unwrap())
            .certificate_authority(true)
            .self_sign(&ca_key)
            .unwrap();
        let keypair = Keypair::generate().unwrap();
        let cert = CertificateBuilder::new(DistinguishedName::new("sigul-server.example.org"))
            .validity(ValidityMonths::new(24).unwrap())
            .subject_alt_name("sigul-server.example.org")
            .extended_key_usage([ExtendedKeyUsage::ServerAuth, ExtendedKeyUsage::ClientAuth])
            .sign(&keypair, &ca, &ca_key)
            .unwrap();
        (cert, keypair)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (cert, keypair) = leaf();
        let nickname = Nickname::new("sigul-server-cert").unwrap();
        let bundle = KeyBundle::new(nickname.clone(), cert.clone(), &keypair).unwrap();
        let password = TransportPassword::generate();

        let sealed = bundle.seal(&password).unwrap();
        let opened = sealed.open(&password).unwrap();

        assert_eq!(opened.nickname(), &nickname);
        assert_eq!(opened.certificate(), &cert);
        assert_eq!(opened.keypair().unwrap().public_key(), keypair.public_key());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let (cert, _) = leaf();
        let other = Keypair::generate().unwrap();
        let result = KeyBundle::new(Nickname::new("sigul-server-cert").unwrap(), cert, &other);
        assert!(matches!(result, Err(SealError::InvalidBundle(_))));
    }

    #[test]
    fn test_wrong_password_cannot_open() {
        let (cert, keypair) = leaf();
        let bundle = KeyBundle::new(Nickname::new("sigul-server-cert").unwrap(), cert, &keypair).unwrap();
        let sealed = bundle.seal(&TransportPassword::generate()).unwrap();

        assert!(matches!(
            sealed.open(&TransportPassword::generate()),
            Err(SealError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_sealed_bytes_do_not_contain_key() {
        let (cert, keypair) = leaf();
        let secret = keypair.to_pem();
        let bundle = KeyBundle::new(Nickname::new("sigul-server-cert").unwrap(), cert, &keypair).unwrap();
        let sealed = bundle.seal(&TransportPassword::generate()).unwrap();

        let text = String::from_utf8_lossy(sealed.as_bytes());
        assert!(!text.contains("PRIVATE KEY"));
        let body = secret.lines().nth(1).unwrap();
        assert!(!text.contains(body));
    }

    #[test]
    fn test_corrupt_bundle_rejected() {
        let password = TransportPassword::generate();
        let sealed = SealedBundle::from_bytes(vec![0xa0, 0x01, 0x02]);
        assert!(sealed.open(&password).is_err());
    }
}
