//! Principals: the deployed roles of the signing stack.
//!
//! The authority principal is the bridge. It holds the root signing key and
//! also carries its own leaf certificate for TLS, like every other principal.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::certificate::ExtendedKeyUsage;
use crate::trust::TrustSubject;
use crate::types::{Fqdn, Nickname, ValidityMonths};

/// Nickname of the authority certificate in every store.
pub const AUTHORITY_NICKNAME: &str = "sigul-ca";

/// Subject common name of the authority certificate.
pub const AUTHORITY_COMMON_NAME: &str = "Sigul CA";

/// Subject organization of every certificate issued by the authority.
pub const AUTHORITY_ORGANIZATION: &str = "Sigul";

/// The role a principal plays in the signing stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The bridge. Holds the root key and issues every certificate.
    #[serde(alias = "bridge")]
    Authority,
    /// The signing server.
    Server,
    /// A signing client.
    Client,
}

impl Role {
    /// Short role label used in nicknames and paths.
    pub fn label(self) -> &'static str {
        match self {
            Role::Authority => "bridge",
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// Nickname of this role's leaf certificate.
    pub fn leaf_nickname(self) -> Nickname {
        match self {
            Role::Authority => Nickname::from_static("sigul-bridge-cert"),
            Role::Server => Nickname::from_static("sigul-server-cert"),
            Role::Client => Nickname::from_static("sigul-client-cert"),
        }
    }

    /// Extended key usages granted to this role's leaf certificate.
    ///
    /// Bridge and server terminate and originate TLS; clients only authenticate.
    pub fn extended_key_usage(self) -> Vec<ExtendedKeyUsage> {
        match self {
            Role::Authority | Role::Server => {
                vec![ExtendedKeyUsage::ServerAuth, ExtendedKeyUsage::ClientAuth]
            }
            Role::Client => vec![ExtendedKeyUsage::ClientAuth],
        }
    }

    pub fn is_authority(self) -> bool {
        matches!(self, Role::Authority)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One deployed principal. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique name within the deployment (also the store directory name).
    pub name: String,
    pub role: Role,
    pub fqdn: Fqdn,
    /// Validity of this principal's leaf certificate.
    pub validity: ValidityMonths,
}

impl Principal {
    pub fn new(name: impl Into<String>, role: Role, fqdn: Fqdn, validity: ValidityMonths) -> Self {
        Self {
            name: name.into(),
            role,
            fqdn,
            validity,
        }
    }

    /// Nickname of the authority certificate.
    pub fn authority_nickname() -> Nickname {
        Nickname::from_static(AUTHORITY_NICKNAME)
    }

    /// Nickname of this principal's own leaf certificate.
    pub fn leaf_nickname(&self) -> Nickname {
        self.role.leaf_nickname()
    }

    /// Whether this principal owns the authority store.
    pub fn is_authority(&self) -> bool {
        self.role.is_authority()
    }

    /// Trust subject of this principal's leaf.
    pub fn leaf_subject(&self) -> TrustSubject {
        TrustSubject::Leaf(self.role)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.role, self.fqdn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_nicknames_are_distinct() {
        let names: Vec<_> = [Role::Authority, Role::Server, Role::Client]
            .iter()
            .map(|r| r.leaf_nickname())
            .collect();
        assert_eq!(names[0].as_str(), "sigul-bridge-cert");
        assert_eq!(names[1].as_str(), "sigul-server-cert");
        assert_eq!(names[2].as_str(), "sigul-client-cert");
        assert!(names.iter().all(|n| n.as_str() != AUTHORITY_NICKNAME));
    }

    #[test]
    fn test_eku_by_role() {
        assert_eq!(
            Role::Server.extended_key_usage(),
            vec![ExtendedKeyUsage::ServerAuth, ExtendedKeyUsage::ClientAuth]
        );
        assert_eq!(Role::Authority.extended_key_usage(), Role::Server.extended_key_usage());
        assert_eq!(Role::Client.extended_key_usage(), vec![ExtendedKeyUsage::ClientAuth]);
    }

    #[test]
    fn test_role_serde_accepts_bridge_alias() {
        let role: Role = serde_json::from_str("\"bridge\"").unwrap();
        assert_eq!(role, Role::Authority);
        assert_eq!(serde_json::to_value(Role::Authority).unwrap(), "authority");
    }
}
