//! In-memory implementation of the CredentialStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use sigul_pki_core::{Certificate, CertificateRecord, Keypair, Nickname, TrustAttributes};
use sigul_pki_transport::{KeyBundle, SealedBundle, TransportPassword};

use crate::error::{Result, StoreError};
use crate::issue::{check_import, ensure_exportable, ensure_key_matches, issue_leaf, issue_self_signed};
use crate::traits::{CredentialStore, LeafRequest, SelfSignedRequest};

/// In-memory credential store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryCredentialStore {
    name: String,
    inner: RwLock<BTreeMap<Nickname, Entry>>,
}

struct Entry {
    certificate: Certificate,
    trust: TrustAttributes,
    key: Option<Keypair>,
}

impl Entry {
    fn record(&self, nickname: &Nickname) -> Result<CertificateRecord> {
        Ok(CertificateRecord::from_certificate(
            nickname.clone(),
            &self.certificate,
            self.trust,
            self.key.is_some(),
        ))
    }
}

impl MemoryCredentialStore {
    /// Create a new empty store labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Read back a held private key, for moving keys to another backend
    /// with [`CredentialStore::insert_private_key`].
    pub fn private_key(&self, nickname: &Nickname) -> Result<Option<Keypair>> {
        Ok(self.read()?.get(nickname).and_then(|e| e.key.clone()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Nickname, Entry>>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Task("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Nickname, Entry>>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Task("store lock poisoned".into()))
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn location(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn generate_self_signed(&self, request: SelfSignedRequest) -> Result<CertificateRecord> {
        let mut inner = self.write()?;
        if inner.contains_key(&request.nickname) {
            return Err(StoreError::AlreadyExists(request.nickname));
        }

        let (certificate, keypair) = issue_self_signed(&request)?;
        let entry = Entry {
            certificate,
            trust: request.trust,
            key: Some(keypair),
        };
        let record = entry.record(&request.nickname)?;
        inner.insert(request.nickname, entry);
        Ok(record)
    }

    async fn generate_signed_leaf(&self, request: LeafRequest) -> Result<CertificateRecord> {
        let mut inner = self.write()?;
        if inner.contains_key(&request.nickname) {
            return Err(StoreError::AlreadyExists(request.nickname));
        }

        let issuer = inner
            .get(&request.issuer)
            .ok_or_else(|| StoreError::IssuerUnavailable {
                issuer: request.issuer.clone(),
                reason: "not in store".into(),
            })?;
        let issuer_key = issuer
            .key
            .as_ref()
            .ok_or_else(|| StoreError::IssuerUnavailable {
                issuer: request.issuer.clone(),
                reason: "private key not held".into(),
            })?;

        let (certificate, keypair) = issue_leaf(&request, &issuer.certificate, issuer_key)?;
        let entry = Entry {
            certificate,
            trust: request.trust,
            key: Some(keypair),
        };
        let record = entry.record(&request.nickname)?;
        inner.insert(request.nickname, entry);
        Ok(record)
    }

    async fn set_trust(&self, nickname: &Nickname, trust: TrustAttributes) -> Result<()> {
        let mut inner = self.write()?;
        let entry = inner
            .get_mut(nickname)
            .ok_or_else(|| StoreError::NotFound(nickname.clone()))?;
        entry.trust = trust;
        Ok(())
    }

    async fn export_certificate(&self, nickname: &Nickname) -> Result<Certificate> {
        let inner = self.read()?;
        inner
            .get(nickname)
            .map(|e| e.certificate.clone())
            .ok_or_else(|| StoreError::NotFound(nickname.clone()))
    }

    async fn export_bundle(
        &self,
        nickname: &Nickname,
        password: &TransportPassword,
    ) -> Result<SealedBundle> {
        let inner = self.read()?;
        let entry = inner
            .get(nickname)
            .ok_or_else(|| StoreError::NotFound(nickname.clone()))?;
        ensure_exportable(nickname, &entry.certificate)?;
        let key = entry
            .key
            .as_ref()
            .ok_or_else(|| StoreError::MissingPrivateKey(nickname.clone()))?;

        let bundle = KeyBundle::new(nickname.clone(), entry.certificate.clone(), key)?;
        Ok(bundle.seal(password)?)
    }

    async fn import_certificate(
        &self,
        nickname: &Nickname,
        certificate: &Certificate,
        trust: TrustAttributes,
    ) -> Result<CertificateRecord> {
        let mut inner = self.write()?;
        let present = check_import(nickname, inner.get(nickname).map(|e| &e.certificate), certificate)?;

        if present {
            if let Some(entry) = inner.get_mut(nickname) {
                entry.trust = trust;
                return entry.record(nickname);
            }
        }

        let entry = Entry {
            certificate: certificate.clone(),
            trust,
            key: None,
        };
        let record = entry.record(nickname)?;
        inner.insert(nickname.clone(), entry);
        Ok(record)
    }

    async fn import_bundle(
        &self,
        bundle: &SealedBundle,
        password: &TransportPassword,
        trust: TrustAttributes,
    ) -> Result<CertificateRecord> {
        let opened = bundle.open(password)?;
        let nickname = opened.nickname().clone();
        let keypair = opened.keypair()?;

        let mut inner = self.write()?;
        check_import(&nickname, inner.get(&nickname).map(|e| &e.certificate), opened.certificate())?;

        let entry = Entry {
            certificate: opened.certificate().clone(),
            trust,
            key: Some(keypair),
        };
        let record = entry.record(&nickname)?;
        inner.insert(nickname, entry);
        Ok(record)
    }

    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        let inner = self.read()?;
        inner.iter().map(|(nick, entry)| entry.record(nick)).collect()
    }

    async fn has_private_key(&self, nickname: &Nickname) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner.get(nickname).is_some_and(|e| e.key.is_some()))
    }

    async fn certificate(&self, nickname: &Nickname) -> Result<Option<Certificate>> {
        let inner = self.read()?;
        Ok(inner.get(nickname).map(|e| e.certificate.clone()))
    }

    async fn insert_private_key(&self, nickname: &Nickname, keypair: &Keypair) -> Result<()> {
        let mut inner = self.write()?;
        let entry = inner
            .get_mut(nickname)
            .ok_or_else(|| StoreError::NotFound(nickname.clone()))?;
        ensure_key_matches(nickname, &entry.certificate, keypair)?;
        entry.key = Some(keypair.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sigul_pki_core::{DistinguishedName, ExtendedKeyUsage, ValidityMonths};

    fn nick(s: &str) -> Nickname {
        Nickname::new(s).unwrap()
    }

    fn ca_request() -> SelfSignedRequest {
        SelfSignedRequest {
            nickname: nick("sigul-ca"),
            subject: DistinguishedName::new("Sigul CA"),
            validity: ValidityMonths::new(120).unwrap(),
            trust: "CTu,Cu,Cu".parse().unwrap(),
        }
    }

    fn leaf_request(name: &str, fqdn: &str) -> LeafRequest {
        LeafRequest {
            nickname: nick(name),
            issuer: nick("sigul-ca"),
            subject: DistinguishedName::new(fqdn),
            subject_alt_names: vec![fqdn.to_string()],
            extended_key_usage: vec![ExtendedKeyUsage::ServerAuth, ExtendedKeyUsage::ClientAuth],
            validity: ValidityMonths::new(24).unwrap(),
            trust: "Pu,Pu,Pu".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_generate_ca_and_leaf() {
        let store = MemoryCredentialStore::new("bridge");
        let ca = store.generate_self_signed(ca_request()).await.unwrap();
        assert!(ca.is_ca);
        assert!(ca.has_private_key);

        let leaf = store
            .generate_signed_leaf(leaf_request("sigul-server-cert", "sigul-server.example.org"))
            .await
            .unwrap();
        assert_eq!(leaf.subject_cn, "sigul-server.example.org");
        assert_eq!(leaf.issuer_cn, "Sigul CA");

        let all = store.list_certificates().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_leaf_requires_issuer_key() {
        let store = MemoryCredentialStore::new("server");
        let err = store
            .generate_signed_leaf(leaf_request("sigul-server-cert", "s.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IssuerUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_generation_refused() {
        let store = MemoryCredentialStore::new("bridge");
        store.generate_self_signed(ca_request()).await.unwrap();
        let err = store.generate_self_signed(ca_request()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_ca_key_never_exported() {
        let store = MemoryCredentialStore::new("bridge");
        store.generate_self_signed(ca_request()).await.unwrap();
        let err = store
            .export_bundle(&nick("sigul-ca"), &TransportPassword::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Refused(_)));
    }

    #[tokio::test]
    async fn test_bundle_moves_leaf_between_stores() {
        let authority = MemoryCredentialStore::new("bridge");
        authority.generate_self_signed(ca_request()).await.unwrap();
        authority
            .generate_signed_leaf(leaf_request("sigul-server-cert", "sigul-server.example.org"))
            .await
            .unwrap();

        let password = TransportPassword::generate();
        let bundle = authority
            .export_bundle(&nick("sigul-server-cert"), &password)
            .await
            .unwrap();
        let ca = authority.export_certificate(&nick("sigul-ca")).await.unwrap();

        let server = MemoryCredentialStore::new("server");
        server
            .import_certificate(&nick("sigul-ca"), &ca, "CT,C,C".parse().unwrap())
            .await
            .unwrap();
        let record = server
            .import_bundle(&bundle, &password, "Pu,Pu,Pu".parse().unwrap())
            .await
            .unwrap();

        assert!(record.has_private_key);
        assert!(!server.has_private_key(&nick("sigul-ca")).await.unwrap());
        assert!(server.has_private_key(&nick("sigul-server-cert")).await.unwrap());
    }

    #[tokio::test]
    async fn test_reimport_same_certificate_updates_trust_only() {
        let authority = MemoryCredentialStore::new("bridge");
        authority.generate_self_signed(ca_request()).await.unwrap();
        let ca = authority.export_certificate(&nick("sigul-ca")).await.unwrap();

        let server = MemoryCredentialStore::new("server");
        server
            .import_certificate(&nick("sigul-ca"), &ca, "CTu,Cu,Cu".parse().unwrap())
            .await
            .unwrap();
        let record = server
            .import_certificate(&nick("sigul-ca"), &ca, "CT,C,C".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(record.trust_attributes.to_string(), "CT,C,C");

        let other = MemoryCredentialStore::new("other");
        other.generate_self_signed(ca_request()).await.unwrap();
        let foreign = other.export_certificate(&nick("sigul-ca")).await.unwrap();
        let err = server
            .import_certificate(&nick("sigul-ca"), &foreign, "CT,C,C".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_insert_private_key_must_match() {
        let authority = MemoryCredentialStore::new("bridge");
        authority.generate_self_signed(ca_request()).await.unwrap();
        let ca = authority.export_certificate(&nick("sigul-ca")).await.unwrap();

        let server = MemoryCredentialStore::new("server");
        server
            .import_certificate(&nick("sigul-ca"), &ca, "CT,C,C".parse().unwrap())
            .await
            .unwrap();
        let err = server
            .insert_private_key(&nick("sigul-ca"), &Keypair::generate().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Refused(_)));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let store = MemoryCredentialStore::new("bridge");
        store.generate_self_signed(ca_request()).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.list_certificates().await.unwrap().is_empty());
        assert!(!store.has_private_key(&nick("sigul-ca")).await.unwrap());
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_import_keeps_trust_and_never_grants_a_key(
            ssl in "[pPcCTu]{0,4}",
            email in "[pPcCTu]{0,4}",
            object_signing in "[pPcCTu]{0,4}",
        ) {
            let trust: TrustAttributes = format!("{ssl},{email},{object_signing}").parse().unwrap();
            let (record, listed, has_key) = block_on(async {
                let authority = MemoryCredentialStore::new("bridge");
                authority.generate_self_signed(ca_request()).await.unwrap();
                let ca = authority.export_certificate(&nick("sigul-ca")).await.unwrap();

                let store = MemoryCredentialStore::new("server");
                let record = store.import_certificate(&nick("sigul-ca"), &ca, trust).await.unwrap();
                let listed = store.list_certificates().await.unwrap();
                let has_key = store.has_private_key(&nick("sigul-ca")).await.unwrap();
                (record, listed, has_key)
            });

            prop_assert_eq!(record.trust_attributes, trust);
            prop_assert!(!record.has_private_key);
            prop_assert!(!has_key);
            prop_assert_eq!(listed, vec![record]);
        }

        #[test]
        fn test_listing_is_sorted_by_nickname(
            names in proptest::collection::btree_set("[a-z]{1,8}-cert", 1..5),
        ) {
            let mut shuffled: Vec<String> = names.iter().cloned().collect();
            shuffled.reverse();
            let listed = block_on(async {
                let store = MemoryCredentialStore::new("bridge");
                store.generate_self_signed(ca_request()).await.unwrap();
                for name in &shuffled {
                    store
                        .generate_signed_leaf(leaf_request(name, "sigul-server.example.org"))
                        .await
                        .unwrap();
                }
                store.list_certificates().await.unwrap()
            });

            let nicknames: Vec<&str> = listed.iter().map(|r| r.nickname.as_str()).collect();
            let mut expected: Vec<&str> = names.iter().map(String::as_str).collect();
            expected.push("sigul-ca");
            expected.sort_unstable();
            prop_assert_eq!(nicknames, expected);
            prop_assert!(listed.iter().all(|r| r.has_private_key));
        }
    }
}
