//! On-disk layout of export artifacts and transport secrets.
//!
//! ```text
//! <export_root>/bridge-ca.crt                     authority public certificate
//! <export_root>/<principal>/bridge-ca.crt         same, per consumer
//! <export_root>/<principal>/<nickname>.crt        consumer leaf certificate
//! <export_root>/<principal>/<nickname>.bundle     sealed leaf + key
//! <secrets_root>/<principal>/transport.pass       bundle password (0600)
//! <secrets_root>/<principal>/reexport.request     consumer asks for a new bundle
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sigul_pki_core::Nickname;

use crate::bundle::SealedBundle;
use crate::error::{Result, SealError};
use crate::password::TransportPassword;

/// File name of the exported authority certificate.
pub const AUTHORITY_CERTIFICATE_FILE: &str = "bridge-ca.crt";

/// File name of a consumer's transport password.
pub const TRANSPORT_PASSWORD_FILE: &str = "transport.pass";

/// Left by a consumer that needs its bundle again after the password was
/// consumed. Cleared by the next export for that consumer.
pub const REEXPORT_REQUEST_FILE: &str = "reexport.request";

/// Where export artifacts and transport secrets live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    export_root: PathBuf,
    secrets_root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(export_root: impl Into<PathBuf>, secrets_root: impl Into<PathBuf>) -> Self {
        Self {
            export_root: export_root.into(),
            secrets_root: secrets_root.into(),
        }
    }

    pub fn export_root(&self) -> &Path {
        &self.export_root
    }

    pub fn secrets_root(&self) -> &Path {
        &self.secrets_root
    }

    pub fn shared_authority_certificate_path(&self) -> PathBuf {
        self.export_root.join(AUTHORITY_CERTIFICATE_FILE)
    }

    pub fn principal_dir(&self, principal: &str) -> PathBuf {
        self.export_root.join(principal)
    }

    pub fn authority_certificate_path(&self, principal: &str) -> PathBuf {
        self.principal_dir(principal).join(AUTHORITY_CERTIFICATE_FILE)
    }

    pub fn certificate_path(&self, principal: &str, nickname: &Nickname) -> PathBuf {
        self.principal_dir(principal).join(format!("{nickname}.crt"))
    }

    pub fn bundle_path(&self, principal: &str, nickname: &Nickname) -> PathBuf {
        self.principal_dir(principal).join(format!("{nickname}.bundle"))
    }

    pub fn password_path(&self, principal: &str) -> PathBuf {
        self.secrets_root.join(principal).join(TRANSPORT_PASSWORD_FILE)
    }

    pub fn reexport_request_path(&self, principal: &str) -> PathBuf {
        self.secrets_root.join(principal).join(REEXPORT_REQUEST_FILE)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SealError::io(parent, e))?;
    }
    Ok(())
}

/// Write `contents` to a sibling temporary file, then rename it over `path`.
///
/// Readers see either the old file or the complete new one. The temporary
/// file is created fresh with `mode`, so the contents are never readable
/// under looser permissions.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temporary_path(path);
    // Left over from an interrupted write.
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SealError::io(&tmp, e)),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let written = options.open(&tmp).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(SealError::io(path, e));
    }
    Ok(())
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a public artifact (certificate PEM or sealed bundle).
pub fn write_public(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic(path, contents, 0o644)?;
    tracing::debug!(path = %path.display(), "artifact written");
    Ok(())
}

/// Write a secret file readable only by its owner.
///
/// The file replaces any previous one atomically and is mode 0600 from the
/// moment it exists.
pub fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic(path, contents, 0o600)?;
    tracing::debug!(path = %path.display(), "secret written");
    Ok(())
}

pub fn write_password(path: &Path, password: &TransportPassword) -> Result<()> {
    let mut line = zeroize::Zeroizing::new(password.expose().to_string());
    line.push('\n');
    write_secret(path, line.as_bytes())
}

pub fn read_password(path: &Path) -> Result<TransportPassword> {
    let contents = zeroize::Zeroizing::new(fs::read_to_string(path).map_err(|e| SealError::io(path, e))?);
    TransportPassword::from_file_contents(&contents)
}

pub fn read_bundle(path: &Path) -> Result<SealedBundle> {
    let bytes = fs::read(path).map_err(|e| SealError::io(path, e))?;
    Ok(SealedBundle::from_bytes(bytes))
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| SealError::io(path, e))
}

/// Delete a consumed transport password. A missing file is not an error.
pub fn consume_password(path: &Path) -> Result<()> {
    if remove_if_present(path)? {
        tracing::info!(path = %path.display(), "transport password consumed");
    }
    Ok(())
}

/// Ask the authority to export this consumer's bundle again.
pub fn request_reexport(path: &Path) -> Result<()> {
    write_public(path, b"")?;
    tracing::info!(path = %path.display(), "re-export requested");
    Ok(())
}

/// Drop a pending re-export request once a new bundle is out.
pub fn clear_reexport_request(path: &Path) -> Result<()> {
    if remove_if_present(path)? {
        tracing::debug!(path = %path.display(), "re-export request cleared");
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SealError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("/var/sigul/ca-export", "/var/sigul/secrets");
        let nick = Nickname::new("sigul-server-cert").unwrap();

        assert_eq!(
            layout.shared_authority_certificate_path(),
            PathBuf::from("/var/sigul/ca-export/bridge-ca.crt")
        );
        assert_eq!(
            layout.authority_certificate_path("server"),
            PathBuf::from("/var/sigul/ca-export/server/bridge-ca.crt")
        );
        assert_eq!(
            layout.bundle_path("server", &nick),
            PathBuf::from("/var/sigul/ca-export/server/sigul-server-cert.bundle")
        );
        assert_eq!(
            layout.password_path("server"),
            PathBuf::from("/var/sigul/secrets/server/transport.pass")
        );
    }

    #[test]
    fn test_password_file_roundtrip_and_consume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server").join(TRANSPORT_PASSWORD_FILE);
        let password = TransportPassword::generate();

        write_password(&path, &password).unwrap();
        assert_eq!(read_password(&path).unwrap(), password);

        consume_password(&path).unwrap();
        assert!(!path.exists());
        let err = read_password(&path).unwrap_err();
        assert!(err.is_not_found());

        // Consuming twice is harmless.
        consume_password(&path).unwrap();
    }

    #[test]
    fn test_reexport_request_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("export"), dir.path().join("secrets"));
        let path = layout.reexport_request_path("client");
        assert_eq!(path.parent(), layout.password_path("client").parent());

        request_reexport(&path).unwrap();
        request_reexport(&path).unwrap();
        assert!(path.exists());

        clear_reexport_request(&path).unwrap();
        assert!(!path.exists());
        clear_reexport_request(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.pass");
        fs::write(&path, b"old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_secret(&path, b"new").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_secret_write_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server").join(TRANSPORT_PASSWORD_FILE);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        // A temporary file left behind by an interrupted write.
        fs::write(temporary_path(&path), b"stale").unwrap();

        write_secret(&path, b"first").unwrap();
        write_secret(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(TRANSPORT_PASSWORD_FILE)]);
    }

    #[test]
    fn test_write_below_a_plain_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("server");
        fs::write(&blocker, b"not a directory").unwrap();

        let err = write_secret(&blocker.join(TRANSPORT_PASSWORD_FILE), b"x").unwrap_err();
        assert!(!err.is_not_found());
    }
}
