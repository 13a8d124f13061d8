//! Deployment configuration.
//!
//! Loaded from a TOML file, overridden by command-line flags, then validated
//! once into a [`Deployment`] that the rest of the crate works with.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sigul_pki_core::{Fqdn, Principal, Role, ValidityMonths};
use sigul_pki_transport::{ArtifactLayout, StorePassword};

use crate::error::{ErrorKind, ProvisionError, Result, Step};

/// Principal name used in errors that concern the whole deployment.
pub const DEPLOYMENT: &str = "deployment";

pub const DEFAULT_AUTHORITY_VALIDITY_MONTHS: u32 = 120;
pub const DEFAULT_LEAF_VALIDITY_MONTHS: u32 = 24;
pub const DEFAULT_STORE_ROOT: &str = "/var/sigul/nss";
pub const DEFAULT_EXPORT_ROOT: &str = "/var/sigul/ca-export";
pub const DEFAULT_SECRETS_ROOT: &str = "/var/sigul/secrets";
pub const DEFAULT_PASSWORD_ENV: &str = "NSS_PASSWORD";

/// Provisioning mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Create what is missing, never overwrite.
    #[default]
    Auto,
    /// Destroy the store and start over, whatever state it is in.
    Force,
    /// Verify only.
    Skip,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Force => "force",
            Mode::Skip => "skip",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_authority_validity() -> u32 {
    DEFAULT_AUTHORITY_VALIDITY_MONTHS
}

fn default_leaf_validity() -> u32 {
    DEFAULT_LEAF_VALIDITY_MONTHS
}

fn default_store_root() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_ROOT)
}

fn default_export_root() -> PathBuf {
    PathBuf::from(DEFAULT_EXPORT_ROOT)
}

fn default_secrets_root() -> PathBuf {
    PathBuf::from(DEFAULT_SECRETS_ROOT)
}

/// The deployment file as written by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub mode: Mode,

    #[serde(default = "default_authority_validity")]
    pub authority_validity_months: u32,

    /// Default leaf validity; principals may override it.
    #[serde(default = "default_leaf_validity")]
    pub leaf_validity_months: u32,

    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    #[serde(default = "default_export_root")]
    pub export_root: PathBuf,

    #[serde(default = "default_secrets_root")]
    pub secrets_root: PathBuf,

    /// Environment variable holding the store open password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// File holding the store open password (first line).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,

    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,
}

/// One `[[principals]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalConfig {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_months: Option<u32>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            authority_validity_months: DEFAULT_AUTHORITY_VALIDITY_MONTHS,
            leaf_validity_months: DEFAULT_LEAF_VALIDITY_MONTHS,
            store_root: default_store_root(),
            export_root: default_export_root(),
            secrets_root: default_secrets_root(),
            password_env: None,
            password_file: None,
            principals: Vec::new(),
        }
    }
}

fn config_error(message: impl Into<String>) -> ProvisionError {
    ProvisionError::new(DEPLOYMENT, Step::Configure, ErrorKind::Configuration(message.into()))
}

impl DeploymentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| config_error(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| config_error(e.to_string()))
    }

    /// Check the configuration and build the validated deployment.
    pub fn validate(&self) -> Result<Deployment> {
        let authority_validity = ValidityMonths::new(self.authority_validity_months)
            .map_err(|e| config_error(format!("authority_validity_months: {e}")))?;

        let password = match (&self.password_env, &self.password_file) {
            (Some(_), Some(_)) => {
                return Err(config_error("set only one of password_env and password_file"))
            }
            (_, Some(path)) => PasswordSource::File(path.clone()),
            (Some(var), None) if var.is_empty() => {
                return Err(config_error("password_env names no variable"))
            }
            (Some(var), None) => PasswordSource::Env(var.clone()),
            (None, None) => PasswordSource::Env(DEFAULT_PASSWORD_ENV.to_string()),
        };

        if self.principals.is_empty() {
            return Err(config_error("no principals configured"));
        }

        let mut names = HashSet::new();
        let mut principals = Vec::with_capacity(self.principals.len());
        for entry in &self.principals {
            if !is_valid_name(&entry.name) {
                return Err(config_error(format!("invalid principal name {:?}", entry.name)));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(config_error(format!("duplicate principal {}", entry.name)));
            }
            if entry.fqdn.is_empty() {
                return Err(config_error(format!("principal {}: missing fqdn", entry.name)));
            }
            let fqdn = Fqdn::new(entry.fqdn.clone())
                .map_err(|e| config_error(format!("principal {}: {e}", entry.name)))?;
            let validity = ValidityMonths::new(entry.validity_months.unwrap_or(self.leaf_validity_months))
                .map_err(|e| config_error(format!("principal {}: {e}", entry.name)))?;
            principals.push(Principal::new(entry.name.clone(), entry.role, fqdn, validity));
        }

        let authorities = principals.iter().filter(|p| p.is_authority()).count();
        if authorities != 1 {
            return Err(config_error(format!(
                "exactly one authority principal is required, found {authorities}"
            )));
        }
        let roles: HashSet<Role> = principals.iter().map(|p| p.role).collect();
        if roles.len() != principals.len() {
            return Err(config_error(
                "each role may appear only once: leaf nicknames are per role",
            ));
        }

        let authority = principals.iter().position(|p| p.is_authority()).unwrap_or_default();

        Ok(Deployment {
            mode: self.mode,
            authority_validity,
            principals,
            store_root: self.store_root.clone(),
            layout: ArtifactLayout::new(&self.export_root, &self.secrets_root),
            password,
            authority,
        })
    }
}

/// Principal names become directory names.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// Where the store open password comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordSource {
    Env(String),
    File(PathBuf),
}

impl PasswordSource {
    /// Read the password. Called once per run.
    pub fn resolve(&self) -> Result<StorePassword> {
        let password = match self {
            PasswordSource::Env(var) => match std::env::var(var) {
                Ok(value) => StorePassword::new(value),
                Err(_) => return Err(config_error(format!("environment variable {var} is not set"))),
            },
            PasswordSource::File(path) => {
                let contents = zeroize::Zeroizing::new(
                    std::fs::read_to_string(path)
                        .map_err(|e| config_error(format!("{}: {e}", path.display())))?,
                );
                StorePassword::from_file_contents(&contents)
            }
        };
        if password.is_empty() {
            return Err(config_error("store open password is empty"));
        }
        Ok(password)
    }
}

/// A validated deployment.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub mode: Mode,
    pub authority_validity: ValidityMonths,
    /// All principals, in configuration order.
    pub principals: Vec<Principal>,
    pub store_root: PathBuf,
    pub layout: ArtifactLayout,
    pub password: PasswordSource,
    authority: usize,
}

impl Deployment {
    /// The authority principal. Validation guarantees there is exactly one.
    pub fn authority(&self) -> &Principal {
        &self.principals[self.authority]
    }

    /// Every principal except the authority.
    pub fn consumers(&self) -> impl Iterator<Item = &Principal> {
        self.principals.iter().filter(|p| !p.is_authority())
    }

    pub fn principal(&self, name: &str) -> Result<&Principal> {
        self.principals
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| config_error(format!("unknown principal {name}")))
    }

    /// Store directory of a principal.
    pub fn store_dir(&self, principal: &Principal) -> PathBuf {
        self.store_root.join(&principal.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode = "auto"
authority_validity_months = 120
leaf_validity_months = 24
store_root = "/srv/nss"
export_root = "/srv/ca-export"
secrets_root = "/srv/secrets"
password_env = "SIGUL_NSS_PASSWORD"

[[principals]]
name = "bridge"
role = "authority"
fqdn = "sigul-bridge.example.org"

[[principals]]
name = "server"
role = "server"
fqdn = "sigul-server.example.org"
validity_months = 12

[[principals]]
name = "client"
role = "client"
fqdn = "sigul-client.example.org"
"#;

    #[test]
    fn test_parse_and_validate() {
        let config = DeploymentConfig::from_toml_str(SAMPLE).unwrap();
        let deployment = config.validate().unwrap();

        assert_eq!(deployment.mode, Mode::Auto);
        assert_eq!(deployment.authority().name, "bridge");
        assert_eq!(deployment.consumers().count(), 2);
        assert_eq!(deployment.principal("server").unwrap().validity.get(), 12);
        assert_eq!(deployment.principal("client").unwrap().validity.get(), 24);
        assert_eq!(
            deployment.store_dir(deployment.principal("client").unwrap()),
            PathBuf::from("/srv/nss/client")
        );
        assert_eq!(deployment.password, PasswordSource::Env("SIGUL_NSS_PASSWORD".into()));
    }

    #[test]
    fn test_defaults() {
        let config = DeploymentConfig::from_toml_str(
            r#"
[[principals]]
name = "bridge"
role = "bridge"
fqdn = "sigul-bridge"
"#,
        )
        .unwrap();
        assert_eq!(config.authority_validity_months, 120);
        assert_eq!(config.leaf_validity_months, 24);
        assert_eq!(config.store_root, PathBuf::from("/var/sigul/nss"));

        let deployment = config.validate().unwrap();
        assert_eq!(deployment.password, PasswordSource::Env("NSS_PASSWORD".into()));
        assert_eq!(
            deployment.layout.shared_authority_certificate_path(),
            PathBuf::from("/var/sigul/ca-export/bridge-ca.crt")
        );
    }

    fn invalid(text: &str) -> ProvisionError {
        DeploymentConfig::from_toml_str(text)
            .and_then(|c| c.validate())
            .unwrap_err()
    }

    #[test]
    fn test_configuration_errors() {
        let cases = [
            // missing fqdn
            "[[principals]]\nname = \"bridge\"\nrole = \"authority\"\n",
            // no authority
            "[[principals]]\nname = \"server\"\nrole = \"server\"\nfqdn = \"s.example.org\"\n",
            // zero validity
            "leaf_validity_months = 0\n[[principals]]\nname = \"bridge\"\nrole = \"authority\"\nfqdn = \"b.example.org\"\n",
            // duplicate names
            "[[principals]]\nname = \"a\"\nrole = \"authority\"\nfqdn = \"a.example.org\"\n[[principals]]\nname = \"a\"\nrole = \"client\"\nfqdn = \"c.example.org\"\n",
            // two authorities
            "[[principals]]\nname = \"a\"\nrole = \"authority\"\nfqdn = \"a.example.org\"\n[[principals]]\nname = \"b\"\nrole = \"authority\"\nfqdn = \"b.example.org\"\n",
            // unknown key
            "colour = \"blue\"\n",
            // both password sources
            "password_env = \"X\"\npassword_file = \"/p\"\n[[principals]]\nname = \"bridge\"\nrole = \"authority\"\nfqdn = \"b.example.org\"\n",
        ];

        for case in cases {
            let err = invalid(case);
            assert!(matches!(err.kind, ErrorKind::Configuration(_)), "{case}: {err}");
            assert_eq!(err.exit_code(), 2);
            assert_eq!(err.step, Step::Configure);
        }
    }

    #[test]
    fn test_password_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nss.pass");
        std::fs::write(&path, "s3cret\n").unwrap();

        let password = PasswordSource::File(path).resolve().unwrap();
        assert_eq!(password.expose(), "s3cret");

        let empty = dir.path().join("empty.pass");
        std::fs::write(&empty, "\n").unwrap();
        assert!(PasswordSource::File(empty).resolve().is_err());
    }

    #[test]
    fn test_missing_password_env() {
        let source = PasswordSource::Env("SIGUL_PKI_TEST_UNSET_VARIABLE".into());
        assert!(matches!(
            source.resolve().unwrap_err().kind,
            ErrorKind::Configuration(_)
        ));
    }
}
