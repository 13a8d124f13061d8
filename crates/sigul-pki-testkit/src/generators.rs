//! Proptest generators for property-based testing.

use proptest::prelude::*;

use sigul_pki::config::PrincipalConfig;
use sigul_pki::DeploymentConfig;
use sigul_pki_core::{Fqdn, Principal, Role, TrustSubject, ValidityMonths};

/// A DNS label: starts with a letter, no trailing hyphen.
pub fn dns_label() -> impl Strategy<Value = String> {
    "[a-z]([a-z0-9-]{0,14}[a-z0-9])?".prop_map(String::from)
}

/// A valid fully qualified domain name with two to four labels.
pub fn fqdn() -> impl Strategy<Value = Fqdn> {
    prop::collection::vec(dns_label(), 2..=4)
        .prop_map(|labels| Fqdn::new(labels.join(".")).expect("generated fqdn is valid"))
}

/// A principal name usable as a directory name.
pub fn principal_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,15}".prop_map(String::from)
}

pub fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Authority), Just(Role::Server), Just(Role::Client)]
}

pub fn trust_subject() -> impl Strategy<Value = TrustSubject> {
    prop_oneof![
        Just(TrustSubject::AuthorityRoot),
        role().prop_map(TrustSubject::Leaf),
    ]
}

pub fn validity() -> impl Strategy<Value = ValidityMonths> {
    (1u32..=ValidityMonths::MAX).prop_map(|m| ValidityMonths::new(m).expect("in range"))
}

pub fn principal() -> impl Strategy<Value = Principal> {
    (principal_name(), role(), fqdn(), validity())
        .prop_map(|(name, role, fqdn, validity)| Principal::new(name, role, fqdn, validity))
}

/// Parameters of a valid deployment: one authority plus any subset of the
/// other roles, with distinct names.
#[derive(Debug, Clone)]
pub struct DeploymentParams {
    pub principals: Vec<Principal>,
    pub authority_validity: ValidityMonths,
}

impl DeploymentParams {
    /// The configuration these parameters describe.
    pub fn config(&self) -> DeploymentConfig {
        DeploymentConfig {
            authority_validity_months: self.authority_validity.get(),
            principals: self
                .principals
                .iter()
                .map(|p| PrincipalConfig {
                    name: p.name.clone(),
                    role: p.role,
                    fqdn: p.fqdn.to_string(),
                    validity_months: Some(p.validity.get()),
                })
                .collect(),
            ..DeploymentConfig::default()
        }
    }
}

impl Arbitrary for DeploymentParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            fqdn(),
            prop::option::of(fqdn()),
            prop::option::of(fqdn()),
            validity(),
            validity(),
        )
            .prop_map(|(bridge, server, client, leaf, authority_validity)| {
                let mut principals = vec![Principal::new("bridge", Role::Authority, bridge, leaf)];
                if let Some(fqdn) = server {
                    principals.push(Principal::new("server", Role::Server, fqdn, leaf));
                }
                if let Some(fqdn) = client {
                    principals.push(Principal::new("client", Role::Client, fqdn, leaf));
                }
                DeploymentParams {
                    principals,
                    authority_validity,
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigul_pki_core::TrustPolicy;

    proptest! {
        #[test]
        fn test_generated_deployments_validate(params: DeploymentParams) {
            let deployment = params.config().validate().unwrap();

            prop_assert_eq!(deployment.authority().name.as_str(), "bridge");
            prop_assert_eq!(deployment.principals.len(), params.principals.len());
            prop_assert_eq!(deployment.authority_validity, params.authority_validity);
        }

        #[test]
        fn test_second_authority_is_rejected(params in any::<DeploymentParams>(), extra in fqdn()) {
            let mut config = params.config();
            config.principals.push(PrincipalConfig {
                name: "second-bridge".into(),
                role: Role::Authority,
                fqdn: extra.to_string(),
                validity_months: None,
            });
            prop_assert!(config.validate().is_err());
        }

        #[test]
        fn test_issuer_trust_only_with_authority_key(
            subject in trust_subject(),
            in_authority_store in any::<bool>(),
        ) {
            let attributes = TrustPolicy::attributes_for(subject, in_authority_store);
            if attributes.is_issuer_capable() {
                prop_assert_eq!(subject, TrustSubject::AuthorityRoot);
                prop_assert!(in_authority_store);
            }
        }
    }
}
