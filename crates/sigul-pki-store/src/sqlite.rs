//! SQLite implementation of the CredentialStore trait.
//!
//! This is the persistent backend: one `store.db` per principal directory.
//! It uses rusqlite with bundled SQLite, wrapped in async via
//! tokio::spawn_blocking.
//!
//! Private keys are sealed at rest under a key derived from the store's
//! open password (Argon2id, salt kept in `store_meta`). The database is
//! opened in exclusive locking mode, so a second process opening the same
//! store fails with [`StoreError::Locked`] instead of writing concurrently.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use zeroize::Zeroizing;

use sigul_pki_core::{Certificate, CertificateRecord, Keypair, Nickname, TrustAttributes};
use sigul_pki_transport::{
    EncryptionKey, KeyBundle, Salt, SealedBlob, SealedBundle, StorePassword, TransportPassword,
};

use crate::error::{Result, StoreError};
use crate::issue::{check_import, ensure_exportable, ensure_key_matches, issue_leaf, issue_self_signed};
use crate::migration;
use crate::traits::{CredentialStore, LeafRequest, SelfSignedRequest};

/// Database file name inside a store directory.
pub const STORE_FILE: &str = "store.db";

const META_SALT: &str = "password_salt";
const META_CHECK: &str = "password_check";
const SEALING_CONTEXT: &str = "sigul-pki-v1 store key sealing";
const CHECK_CONTEXT: &str = "sigul-pki-v1 store password check";

/// SQLite-based credential store.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteCredentialStore {
    dir: PathBuf,
    conn: Arc<Mutex<Connection>>,
    sealing_key: Arc<EncryptionKey>,
}

impl SqliteCredentialStore {
    /// Create a new store in `dir`. Fails if one already exists there.
    pub fn create(dir: impl AsRef<Path>, password: &StorePassword) -> Result<Self> {
        let dir = dir.as_ref();
        if Self::exists(dir) {
            return Err(StoreError::Refused(format!(
                "credential store already exists at {}",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        Self::connect(dir, password)
    }

    /// Open an existing store in `dir`.
    pub fn open(dir: impl AsRef<Path>, password: &StorePassword) -> Result<Self> {
        let dir = dir.as_ref();
        if !Self::exists(dir) {
            return Err(StoreError::Missing(dir.to_path_buf()));
        }
        Self::connect(dir, password)
    }

    /// Open the store in `dir`, creating it on first use.
    pub fn open_or_create(dir: impl AsRef<Path>, password: &StorePassword) -> Result<Self> {
        let dir = dir.as_ref();
        if Self::exists(dir) {
            Self::open(dir, password)
        } else {
            Self::create(dir, password)
        }
    }

    /// Destroy whatever store is in `dir` and create an empty one.
    ///
    /// The old database is never opened with the password, so a forgotten
    /// password, a corrupt file or a failed migration does not block this.
    /// A store held open by another process still fails with
    /// [`StoreError::Locked`].
    pub fn recreate(dir: impl AsRef<Path>, password: &StorePassword) -> Result<Self> {
        let dir = dir.as_ref();
        Self::destroy(dir)?;
        Self::create(dir, password)
    }

    /// Remove the store database in `dir` along with its journal files.
    ///
    /// Returns whether a database was there.
    pub fn destroy(dir: impl AsRef<Path>) -> Result<bool> {
        let dir = dir.as_ref();
        let db_path = dir.join(STORE_FILE);
        if !db_path.exists() {
            return Ok(false);
        }
        ensure_unlocked(&db_path)?;

        for suffix in ["", "-journal", "-wal", "-shm"] {
            let path = dir.join(format!("{STORE_FILE}{suffix}"));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(path = %db_path.display(), "credential store destroyed");
        Ok(true)
    }

    /// Whether a store database exists in `dir`.
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        dir.as_ref().join(STORE_FILE).is_file()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn connect(dir: &Path, password: &StorePassword) -> Result<Self> {
        if password.is_empty() {
            return Err(StoreError::Refused("empty store password".into()));
        }

        let db_path = dir.join(STORE_FILE);
        let mut conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::ZERO)?;
        conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| {
            row.get::<_, String>(0)
        })?;
        // The first write takes the lock; exclusive mode keeps it until close.
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| locked_or(e, &db_path))?;
        migration::migrate(&mut conn)?;

        let root = unlock_or_initialize(&conn, password)?;

        tracing::debug!(path = %db_path.display(), "credential store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
            sealing_key: Arc::new(root.derive_subkey(SEALING_CONTEXT)),
        })
    }

    /// Read back a held private key, for moving keys to another backend
    /// with [`CredentialStore::insert_private_key`].
    pub async fn private_key(&self, nickname: &Nickname) -> Result<Option<Keypair>> {
        let nickname = nickname.clone();
        self.run(move |conn, key| match load(conn, &nickname)? {
            Some(row) => row.keypair(key),
            None => Ok(None),
        })
        .await
    }

    /// Execute a blocking operation on the connection.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &EncryptionKey) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let key = self.sealing_key.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Task(format!("mutex poisoned: {e}")))?;
            f(&mut conn, &key)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {e}")))?
    }
}

/// Fail if another connection holds the database. Anything else wrong with
/// the file is ignored: it is about to be deleted.
fn ensure_unlocked(db_path: &Path) -> Result<()> {
    let Ok(conn) = Connection::open(db_path) else {
        return Ok(());
    };
    conn.busy_timeout(Duration::ZERO)?;
    match conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;") {
        Err(e) => match locked_or(e, db_path) {
            StoreError::Locked(path) => Err(StoreError::Locked(path)),
            _ => Ok(()),
        },
        Ok(()) => Ok(()),
    }
}

fn locked_or(e: rusqlite::Error, path: &Path) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Locked(path.to_path_buf())
        }
        _ => StoreError::Database(e),
    }
}

fn unlock_or_initialize(conn: &Connection, password: &StorePassword) -> Result<EncryptionKey> {
    let salt: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![META_SALT],
            |row| row.get(0),
        )
        .optional()?;

    match salt {
        Some(salt) => {
            let salt = Salt::from_bytes(
                salt.try_into()
                    .map_err(|_| StoreError::InvalidData("bad password salt".into()))?,
            );
            let root = EncryptionKey::derive_from_passphrase(password.expose().as_bytes(), &salt)?;
            let expected: Vec<u8> = conn.query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![META_CHECK],
                |row| row.get(0),
            )?;
            if root.derive_subkey(CHECK_CONTEXT).as_bytes().as_slice() != expected.as_slice() {
                return Err(StoreError::WrongPassword);
            }
            Ok(root)
        }
        None => {
            let salt = Salt::generate();
            let root = EncryptionKey::derive_from_passphrase(password.expose().as_bytes(), &salt)?;
            let check = root.derive_subkey(CHECK_CONTEXT);
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2), (?3, ?4)",
                params![
                    META_SALT,
                    salt.as_bytes().as_slice(),
                    META_CHECK,
                    check.as_bytes().as_slice()
                ],
            )?;
            tracing::info!("credential store initialized");
            Ok(root)
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct StoredRow {
    certificate: Certificate,
    trust: TrustAttributes,
    sealed_key: Option<Vec<u8>>,
}

impl StoredRow {
    fn record(&self, nickname: &Nickname) -> Result<CertificateRecord> {
        Ok(CertificateRecord::from_certificate(
            nickname.clone(),
            &self.certificate,
            self.trust,
            self.sealed_key.is_some(),
        ))
    }

    fn keypair(&self, key: &EncryptionKey) -> Result<Option<Keypair>> {
        self.sealed_key
            .as_deref()
            .map(|sealed| open_key(sealed, key))
            .transpose()
    }
}

fn load(conn: &Connection, nickname: &Nickname) -> Result<Option<StoredRow>> {
    let row: Option<(Vec<u8>, String, Option<Vec<u8>>)> = conn
        .query_row(
            "SELECT certificate, trust, sealed_key FROM certificates WHERE nickname = ?1",
            params![nickname.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(cert, trust, sealed_key)| decode_row(&cert, &trust, sealed_key))
        .transpose()
}

fn decode_row(cert: &[u8], trust: &str, sealed_key: Option<Vec<u8>>) -> Result<StoredRow> {
    Ok(StoredRow {
        certificate: Certificate::from_der(cert)
            .map_err(|e| StoreError::InvalidData(format!("stored certificate: {e}")))?,
        trust: trust
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("stored trust: {e}")))?,
        sealed_key,
    })
}

fn seal_key(keypair: &Keypair, key: &EncryptionKey) -> Result<Vec<u8>> {
    let pem = keypair.to_pem();
    Ok(SealedBlob::seal_with_key(pem.as_bytes(), key)?.to_bytes()?)
}

fn open_key(sealed: &[u8], key: &EncryptionKey) -> Result<Keypair> {
    let blob = SealedBlob::from_bytes(sealed)?;
    let secret = Zeroizing::new(blob.open_with_key(key)?);
    let pem = std::str::from_utf8(&secret)
        .map_err(|_| StoreError::InvalidData("sealed private key is not PEM".into()))?;
    Ok(Keypair::from_pem(pem)?)
}

fn insert(
    conn: &Connection,
    nickname: &Nickname,
    certificate: &Certificate,
    trust: TrustAttributes,
    sealed_key: Option<&[u8]>,
) -> Result<()> {
    let now = now_millis();
    conn.execute(
        "INSERT INTO certificates (nickname, serial, certificate, trust, sealed_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            nickname.as_str(),
            certificate.serial().as_bytes().as_slice(),
            certificate.der(),
            trust.to_string(),
            sealed_key,
            now,
        ],
    )?;
    Ok(())
}

fn update(
    conn: &Connection,
    nickname: &Nickname,
    trust: TrustAttributes,
    sealed_key: Option<Option<&[u8]>>,
) -> Result<()> {
    let changed = match sealed_key {
        Some(sealed_key) => conn.execute(
            "UPDATE certificates SET trust = ?1, sealed_key = ?2, updated_at = ?3 WHERE nickname = ?4",
            params![trust.to_string(), sealed_key, now_millis(), nickname.as_str()],
        )?,
        None => conn.execute(
            "UPDATE certificates SET trust = ?1, updated_at = ?2 WHERE nickname = ?3",
            params![trust.to_string(), now_millis(), nickname.as_str()],
        )?,
    };
    if changed == 0 {
        return Err(StoreError::NotFound(nickname.clone()));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    async fn generate_self_signed(&self, request: SelfSignedRequest) -> Result<CertificateRecord> {
        self.run(move |conn, key| {
            let tx = conn.transaction()?;
            if load(&tx, &request.nickname)?.is_some() {
                return Err(StoreError::AlreadyExists(request.nickname));
            }

            let (certificate, keypair) = issue_self_signed(&request)?;
            let sealed = seal_key(&keypair, key)?;
            insert(&tx, &request.nickname, &certificate, request.trust, Some(&sealed))?;
            tx.commit()?;

            Ok(CertificateRecord::from_certificate(
                request.nickname,
                &certificate,
                request.trust,
                true,
            ))
        })
        .await
    }

    async fn generate_signed_leaf(&self, request: LeafRequest) -> Result<CertificateRecord> {
        self.run(move |conn, key| {
            let tx = conn.transaction()?;
            if load(&tx, &request.nickname)?.is_some() {
                return Err(StoreError::AlreadyExists(request.nickname));
            }

            let issuer = load(&tx, &request.issuer)?.ok_or_else(|| StoreError::IssuerUnavailable {
                issuer: request.issuer.clone(),
                reason: "not in store".into(),
            })?;
            let issuer_key = issuer.keypair(key)?.ok_or_else(|| StoreError::IssuerUnavailable {
                issuer: request.issuer.clone(),
                reason: "private key not held".into(),
            })?;

            let (certificate, keypair) = issue_leaf(&request, &issuer.certificate, &issuer_key)?;
            let sealed = seal_key(&keypair, key)?;
            insert(&tx, &request.nickname, &certificate, request.trust, Some(&sealed))?;
            tx.commit()?;

            Ok(CertificateRecord::from_certificate(
                request.nickname,
                &certificate,
                request.trust,
                true,
            ))
        })
        .await
    }

    async fn set_trust(&self, nickname: &Nickname, trust: TrustAttributes) -> Result<()> {
        let nickname = nickname.clone();
        self.run(move |conn, _| update(conn, &nickname, trust, None)).await
    }

    async fn export_certificate(&self, nickname: &Nickname) -> Result<Certificate> {
        let nickname = nickname.clone();
        self.run(move |conn, _| {
            load(conn, &nickname)?
                .map(|row| row.certificate)
                .ok_or(StoreError::NotFound(nickname))
        })
        .await
    }

    async fn export_bundle(
        &self,
        nickname: &Nickname,
        password: &TransportPassword,
    ) -> Result<SealedBundle> {
        let nickname = nickname.clone();
        let password = password.clone();
        self.run(move |conn, key| {
            let row = load(conn, &nickname)?.ok_or_else(|| StoreError::NotFound(nickname.clone()))?;
            ensure_exportable(&nickname, &row.certificate)?;
            let keypair = row
                .keypair(key)?
                .ok_or_else(|| StoreError::MissingPrivateKey(nickname.clone()))?;

            let bundle = KeyBundle::new(nickname, row.certificate, &keypair)?;
            Ok(bundle.seal(&password)?)
        })
        .await
    }

    async fn import_certificate(
        &self,
        nickname: &Nickname,
        certificate: &Certificate,
        trust: TrustAttributes,
    ) -> Result<CertificateRecord> {
        let nickname = nickname.clone();
        let certificate = certificate.clone();
        self.run(move |conn, _| {
            let tx = conn.transaction()?;
            let existing = load(&tx, &nickname)?;
            let present = check_import(&nickname, existing.as_ref().map(|r| &r.certificate), &certificate)?;

            let has_key = match existing {
                Some(row) if present => {
                    update(&tx, &nickname, trust, None)?;
                    row.sealed_key.is_some()
                }
                _ => {
                    insert(&tx, &nickname, &certificate, trust, None)?;
                    false
                }
            };
            tx.commit()?;

            Ok(CertificateRecord::from_certificate(nickname, &certificate, trust, has_key))
        })
        .await
    }

    async fn import_bundle(
        &self,
        bundle: &SealedBundle,
        password: &TransportPassword,
        trust: TrustAttributes,
    ) -> Result<CertificateRecord> {
        let opened = bundle.open(password)?;
        let nickname = opened.nickname().clone();
        let certificate = opened.certificate().clone();
        let keypair = opened.keypair()?;
        drop(opened);

        self.run(move |conn, key| {
            let tx = conn.transaction()?;
            let existing = load(&tx, &nickname)?;
            let present = check_import(&nickname, existing.as_ref().map(|r| &r.certificate), &certificate)?;

            let sealed = seal_key(&keypair, key)?;
            if present {
                update(&tx, &nickname, trust, Some(Some(&sealed)))?;
            } else {
                insert(&tx, &nickname, &certificate, trust, Some(&sealed))?;
            }
            tx.commit()?;

            Ok(CertificateRecord::from_certificate(nickname, &certificate, trust, true))
        })
        .await
    }

    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        self.run(|conn, _| {
            let mut stmt = conn.prepare(
                "SELECT nickname, certificate, trust, sealed_key FROM certificates ORDER BY nickname",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(nickname, cert, trust, sealed_key)| {
                    let nickname = Nickname::new(nickname)
                        .map_err(|e| StoreError::InvalidData(format!("stored nickname: {e}")))?;
                    decode_row(&cert, &trust, sealed_key)?.record(&nickname)
                })
                .collect()
        })
        .await
    }

    async fn has_private_key(&self, nickname: &Nickname) -> Result<bool> {
        let nickname = nickname.clone();
        self.run(move |conn, _| {
            let sealed: Option<Option<Vec<u8>>> = conn
                .query_row(
                    "SELECT sealed_key FROM certificates WHERE nickname = ?1",
                    params![nickname.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(matches!(sealed, Some(Some(_))))
        })
        .await
    }

    async fn certificate(&self, nickname: &Nickname) -> Result<Option<Certificate>> {
        let nickname = nickname.clone();
        self.run(move |conn, _| Ok(load(conn, &nickname)?.map(|row| row.certificate)))
            .await
    }

    async fn record(&self, nickname: &Nickname) -> Result<Option<CertificateRecord>> {
        let nickname = nickname.clone();
        self.run(move |conn, _| load(conn, &nickname)?.map(|row| row.record(&nickname)).transpose())
            .await
    }

    async fn insert_private_key(&self, nickname: &Nickname, keypair: &Keypair) -> Result<()> {
        let nickname = nickname.clone();
        let keypair = keypair.clone();
        self.run(move |conn, key| {
            let row = load(conn, &nickname)?.ok_or_else(|| StoreError::NotFound(nickname.clone()))?;
            ensure_key_matches(&nickname, &row.certificate, &keypair)?;
            let sealed = seal_key(&keypair, key)?;
            update(conn, &nickname, row.trust, Some(Some(&sealed)))
        })
        .await
    }

    async fn reset(&self) -> Result<()> {
        let dir = self.dir.clone();
        self.run(move |conn, _| {
            let removed = conn.execute("DELETE FROM certificates", [])?;
            tracing::warn!(path = %dir.display(), removed, "credential store reset");
            Ok(())
        })
        .await
    }
}
