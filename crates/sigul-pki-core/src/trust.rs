//! Trust attributes and the policy that derives them.
//!
//! Attributes use the NSS `ssl,email,object-signing` triple notation
//! (for example `CT,C,C`). They are always derived from a [`TrustProfile`]
//! through [`TrustPolicy::attributes_for`]; no caller spells them out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::principal::Role;

/// A single trust flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrustFlag {
    /// `p`: valid peer.
    ValidPeer = 0b0000_0001,
    /// `P`: trusted peer.
    TrustedPeer = 0b0000_0010,
    /// `c`: valid CA.
    ValidCa = 0b0000_0100,
    /// `C`: trusted CA for issuing server certificates.
    TrustedCa = 0b0000_1000,
    /// `T`: trusted CA for issuing client certificates.
    TrustedClientCa = 0b0001_0000,
    /// `u`: user certificate; the private key is held by this store.
    User = 0b0010_0000,
}

impl TrustFlag {
    /// Flags in rendering order.
    pub const ALL: [TrustFlag; 6] = [
        TrustFlag::ValidPeer,
        TrustFlag::TrustedPeer,
        TrustFlag::ValidCa,
        TrustFlag::TrustedCa,
        TrustFlag::TrustedClientCa,
        TrustFlag::User,
    ];

    pub fn as_char(self) -> char {
        match self {
            TrustFlag::ValidPeer => 'p',
            TrustFlag::TrustedPeer => 'P',
            TrustFlag::ValidCa => 'c',
            TrustFlag::TrustedCa => 'C',
            TrustFlag::TrustedClientCa => 'T',
            TrustFlag::User => 'u',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_char() == c)
    }
}

/// A set of trust flags for one usage slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrustFlags(u8);

impl TrustFlags {
    pub const EMPTY: Self = Self(0);

    pub fn of(flags: &[TrustFlag]) -> Self {
        Self(flags.iter().fold(0, |acc, f| acc | *f as u8))
    }

    pub fn contains(self, flag: TrustFlag) -> bool {
        self.0 & flag as u8 != 0
    }

    pub fn with(self, flag: TrustFlag) -> Self {
        Self(self.0 | flag as u8)
    }

    pub fn without(self, flag: TrustFlag) -> Self {
        Self(self.0 & !(flag as u8))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TrustFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustFlags({self})")
    }
}

impl fmt::Display for TrustFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for flag in TrustFlag::ALL {
            if self.contains(flag) {
                write!(f, "{}", flag.as_char())?;
            }
        }
        Ok(())
    }
}

impl FromStr for TrustFlags {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.chars().try_fold(Self::EMPTY, |acc, c| {
            TrustFlag::from_char(c)
                .map(|flag| acc.with(flag))
                .ok_or_else(|| CoreError::InvalidTrust(s.to_string()))
        })
    }
}

/// Trust attributes for the three usage slots of a stored certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustAttributes {
    pub ssl: TrustFlags,
    pub email: TrustFlags,
    pub object_signing: TrustFlags,
}

impl TrustAttributes {
    /// No trust at all (`,,`).
    pub const NONE: Self = Self {
        ssl: TrustFlags::EMPTY,
        email: TrustFlags::EMPTY,
        object_signing: TrustFlags::EMPTY,
    };

    fn slots(&self) -> [TrustFlags; 3] {
        [self.ssl, self.email, self.object_signing]
    }

    /// Whether any slot claims the private key is held locally.
    pub fn claims_private_key(&self) -> bool {
        self.slots().iter().any(|s| s.contains(TrustFlag::User))
    }

    /// Whether the attributes make this certificate an accepted issuer.
    pub fn trusts_as_ca(&self) -> bool {
        self.ssl.contains(TrustFlag::TrustedCa) || self.ssl.contains(TrustFlag::TrustedClientCa)
    }

    /// Issuer-capable: a trusted CA whose key is held by this store.
    pub fn is_issuer_capable(&self) -> bool {
        self.trusts_as_ca() && self.claims_private_key()
    }
}

impl fmt::Debug for TrustAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustAttributes({self})")
    }
}

impl fmt::Display for TrustAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.ssl, self.email, self.object_signing)
    }
}

impl FromStr for TrustAttributes {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let (Some(ssl), Some(email), Some(object_signing), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CoreError::InvalidTrust(s.to_string()));
        };
        Ok(Self {
            ssl: ssl.parse()?,
            email: email.parse()?,
            object_signing: object_signing.parse()?,
        })
    }
}

impl TryFrom<String> for TrustAttributes {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TrustAttributes> for String {
    fn from(t: TrustAttributes) -> Self {
        t.to_string()
    }
}

/// What a certificate is, for trust purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustProfile {
    /// The root certificate authority.
    Authority,
    /// A bridge or server identity used for inbound and outbound TLS.
    Peer,
    /// A client identity.
    Client,
}

/// The certificate a trust decision is being made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustSubject {
    /// The authority's self-signed root.
    AuthorityRoot,
    /// A leaf issued to a principal with the given role.
    Leaf(Role),
}

impl TrustSubject {
    pub fn profile(self) -> TrustProfile {
        match self {
            TrustSubject::AuthorityRoot => TrustProfile::Authority,
            TrustSubject::Leaf(Role::Authority | Role::Server) => TrustProfile::Peer,
            TrustSubject::Leaf(Role::Client) => TrustProfile::Client,
        }
    }
}

/// Pure mapping from certificate kind and store context to trust attributes.
pub struct TrustPolicy;

impl TrustPolicy {
    /// Trust attributes a certificate must carry.
    ///
    /// `in_authority_store` is true only for the store that owns the root key.
    /// Outside it the root is validator-only: it may verify chains but is
    /// never marked as holding a key.
    pub fn attributes_for(subject: TrustSubject, in_authority_store: bool) -> TrustAttributes {
        Self::attributes_for_profile(subject.profile(), in_authority_store)
    }

    pub fn attributes_for_profile(
        profile: TrustProfile,
        in_authority_store: bool,
    ) -> TrustAttributes {
        use TrustFlag::*;

        match (profile, in_authority_store) {
            (TrustProfile::Authority, true) => TrustAttributes {
                ssl: TrustFlags::of(&[TrustedCa, TrustedClientCa, User]),
                email: TrustFlags::of(&[TrustedCa, User]),
                object_signing: TrustFlags::of(&[TrustedCa, User]),
            },
            (TrustProfile::Authority, false) => TrustAttributes {
                ssl: TrustFlags::of(&[TrustedCa, TrustedClientCa]),
                email: TrustFlags::of(&[TrustedCa]),
                object_signing: TrustFlags::of(&[TrustedCa]),
            },
            (TrustProfile::Peer, _) => {
                let slot = TrustFlags::of(&[TrustedPeer, User]);
                TrustAttributes {
                    ssl: slot,
                    email: slot,
                    object_signing: slot,
                }
            }
            (TrustProfile::Client, _) => {
                let slot = TrustFlags::of(&[User]);
                TrustAttributes {
                    ssl: slot,
                    email: slot,
                    object_signing: slot,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_authority_attributes_by_store() {
        let own = TrustPolicy::attributes_for(TrustSubject::AuthorityRoot, true);
        let elsewhere = TrustPolicy::attributes_for(TrustSubject::AuthorityRoot, false);

        assert_eq!(own.to_string(), "CTu,Cu,Cu");
        assert_eq!(elsewhere.to_string(), "CT,C,C");
        assert!(own.is_issuer_capable());
        assert!(!elsewhere.is_issuer_capable());
        assert!(elsewhere.trusts_as_ca());
    }

    #[test]
    fn test_leaf_attributes() {
        for in_auth in [true, false] {
            let bridge = TrustPolicy::attributes_for(TrustSubject::Leaf(Role::Authority), in_auth);
            let server = TrustPolicy::attributes_for(TrustSubject::Leaf(Role::Server), in_auth);
            let client = TrustPolicy::attributes_for(TrustSubject::Leaf(Role::Client), in_auth);

            assert_eq!(bridge, server);
            assert_eq!(server.to_string(), "Pu,Pu,Pu");
            assert_eq!(client.to_string(), "u,u,u");
            assert!(!server.trusts_as_ca());
            assert!(!client.trusts_as_ca());
        }
    }

    #[test]
    fn test_server_and_client_never_swap() {
        let server = TrustPolicy::attributes_for(TrustSubject::Leaf(Role::Server), false);
        let client = TrustPolicy::attributes_for(TrustSubject::Leaf(Role::Client), false);
        assert_ne!(server, client);
        assert!(server.ssl.contains(TrustFlag::TrustedPeer));
        assert!(!client.ssl.contains(TrustFlag::TrustedPeer));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("CT,C".parse::<TrustAttributes>().is_err());
        assert!("CT,C,C,C".parse::<TrustAttributes>().is_err());
        assert!("XY,,".parse::<TrustAttributes>().is_err());
        assert_eq!(",,".parse::<TrustAttributes>().unwrap(), TrustAttributes::NONE);
    }

    fn subject() -> impl Strategy<Value = TrustSubject> {
        prop_oneof![
            Just(TrustSubject::AuthorityRoot),
            Just(TrustSubject::Leaf(Role::Authority)),
            Just(TrustSubject::Leaf(Role::Server)),
            Just(TrustSubject::Leaf(Role::Client)),
        ]
    }

    proptest! {
        #[test]
        fn test_rendered_attributes_parse_back(subject in subject(), in_auth in any::<bool>()) {
            let attrs = TrustPolicy::attributes_for(subject, in_auth);
            let parsed: TrustAttributes = attrs.to_string().parse().unwrap();
            prop_assert_eq!(attrs, parsed);
        }

        #[test]
        fn test_only_root_in_own_store_is_issuer(subject in subject(), in_auth in any::<bool>()) {
            let attrs = TrustPolicy::attributes_for(subject, in_auth);
            let expected = subject == TrustSubject::AuthorityRoot && in_auth;
            prop_assert_eq!(attrs.is_issuer_capable(), expected);
        }
    }
}
