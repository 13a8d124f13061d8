//! End-to-end provisioning scenarios over SQLite stores.
//!
//! Each test runs the principals the way separate processes would: a store is
//! opened for one run and closed again, and consumers only see the export
//! directory.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use sigul_pki::store::CredentialStore;
use sigul_pki::{
    audit_stores, deploy, exit, ErrorKind, Expectation, ExportBundler, Finding, InvariantValidator,
    Mode, ProvisioningState, Step,
};
use sigul_pki_core::{Principal, Role, AUTHORITY_COMMON_NAME};
use sigul_pki_testkit::{fqdn_for, DeploymentFixture};
use sigul_pki_transport::artifacts::read_password;

fn authority_nickname() -> sigul_pki_core::Nickname {
    Principal::authority_nickname()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario A: fresh deployment
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_deployment() {
    let fixture = DeploymentFixture::new();
    let outcomes = fixture.provision_all(Mode::Auto).await.unwrap();

    assert!(outcomes.iter().all(|o| o.state == ProvisioningState::Verified));

    let bridge = fixture.store("bridge", Mode::Skip).unwrap();
    let root = bridge.record(&authority_nickname()).await.unwrap().unwrap();
    assert!(root.is_ca);
    assert!(root.has_private_key);
    assert_eq!(root.subject_cn, AUTHORITY_COMMON_NAME);
    assert_eq!(root.trust_attributes.to_string(), "CTu,Cu,Cu");
    drop(bridge);

    for (name, trust) in [("server", "Pu,Pu,Pu"), ("client", "u,u,u")] {
        let principal = fixture.principal(name).clone();
        let store = fixture.store(name, Mode::Skip).unwrap();

        let ca = store.record(&authority_nickname()).await.unwrap().unwrap();
        assert!(!ca.has_private_key, "{name} holds the authority key");
        assert_eq!(ca.trust_attributes.to_string(), "CT,C,C");

        let leaf = store.record(&principal.leaf_nickname()).await.unwrap().unwrap();
        assert!(leaf.has_private_key);
        assert_eq!(leaf.subject_cn, fqdn_for(name));
        assert_eq!(leaf.subject_alt_names, vec![fqdn_for(name)]);
        assert_eq!(leaf.issuer_cn, AUTHORITY_COMMON_NAME);
        assert_eq!(leaf.trust_attributes.to_string(), trust);

        assert!(!fixture.layout().password_path(name).exists());
    }
}

#[tokio::test]
async fn test_leaf_extended_key_usage_by_role() {
    let fixture = DeploymentFixture::new();
    fixture.provision_authority(Mode::Auto).await.unwrap();
    let bridge = fixture.store("bridge", Mode::Skip).unwrap();

    for role in [Role::Authority, Role::Server, Role::Client] {
        let record = bridge.record(&role.leaf_nickname()).await.unwrap().unwrap();
        assert_eq!(record.extended_key_usage, role.extended_key_usage());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario B: idempotent rerun
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rerun_changes_nothing() {
    let fixture = DeploymentFixture::new();
    fixture.provision_all(Mode::Auto).await.unwrap();

    let files = fixture.artifact_files();
    let mut serials = Vec::new();
    for name in ["bridge", "server", "client"] {
        let store = fixture.store(name, Mode::Skip).unwrap();
        serials.push(store.list_certificates().await.unwrap());
    }

    let outcomes = fixture.provision_all(Mode::Auto).await.unwrap();
    assert!(outcomes.iter().all(|o| o.unchanged()));
    assert_eq!(fixture.artifact_files(), files);

    for (name, before) in ["bridge", "server", "client"].into_iter().zip(serials) {
        let store = fixture.store(name, Mode::Skip).unwrap();
        assert_eq!(store.list_certificates().await.unwrap(), before, "{name} changed");
    }
}

#[tokio::test]
async fn test_skip_verifies_provisioned_deployment() {
    let fixture = DeploymentFixture::new();
    fixture.provision_all(Mode::Auto).await.unwrap();

    let outcomes = fixture.provision_all(Mode::Skip).await.unwrap();
    assert!(outcomes.iter().all(|o| o.state == ProvisioningState::Verified));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario C: authority rotated, consumers must follow with force
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_forced_authority_requires_forced_consumers() {
    let fixture = DeploymentFixture::new();
    fixture.provision_all(Mode::Auto).await.unwrap();
    let old = {
        let bridge = fixture.store("bridge", Mode::Skip).unwrap();
        bridge.record(&authority_nickname()).await.unwrap().unwrap()
    };

    let run = fixture.provision_authority(Mode::Force).await.unwrap();
    assert_eq!(run.exported.len(), 3);
    let new = {
        let bridge = fixture.store("bridge", Mode::Skip).unwrap();
        bridge.record(&authority_nickname()).await.unwrap().unwrap()
    };
    assert_ne!(old.serial, new.serial);
    assert_ne!(old.fingerprint, new.fingerprint);

    // The server still trusts the old root and must not silently keep it.
    let err = fixture.provision_principal("server", Mode::Auto).await.unwrap_err();
    assert_eq!(err.step, Step::Verify);
    assert!(err.needs_force());
    assert_eq!(err.exit_code(), exit::FAILURE);

    let outcome = fixture.provision_principal("server", Mode::Force).await.unwrap();
    assert_eq!(outcome.state, ProvisioningState::Verified);
    let server = fixture.store("server", Mode::Skip).unwrap();
    let ca = server.record(&authority_nickname()).await.unwrap().unwrap();
    assert_eq!(ca.serial, new.serial);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario D: authority key planted in a consumer store
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_planted_authority_key_is_security_violation() {
    let fixture = DeploymentFixture::new();
    fixture.provision_all(Mode::Auto).await.unwrap();

    let key = {
        let bridge = fixture.store("bridge", Mode::Skip).unwrap();
        bridge.private_key(&authority_nickname()).await.unwrap().unwrap()
    };
    {
        let server = fixture.store("server", Mode::Skip).unwrap();
        server.insert_private_key(&authority_nickname(), &key).await.unwrap();
    }

    let err = fixture.provision_principal("server", Mode::Auto).await.unwrap_err();
    assert!(err.is_security_violation());
    assert_eq!(err.exit_code(), exit::SECURITY_VIOLATION);

    let bridge = fixture.store("bridge", Mode::Skip).unwrap();
    let server = fixture.store("server", Mode::Skip).unwrap();
    let client = fixture.store("client", Mode::Skip).unwrap();
    let stores: Vec<(&Principal, &dyn CredentialStore)> = vec![
        (fixture.principal("bridge"), &bridge),
        (fixture.principal("server"), &server),
        (fixture.principal("client"), &client),
    ];
    let err = audit_stores(&fixture.deployment, &stores).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::SecurityInvariantViolation(_)));
    assert_eq!(err.principal, "server");
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery after a transport password was consumed
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_forced_consumer_after_success_requests_reexport() {
    let fixture = DeploymentFixture::new();
    fixture.provision_all(Mode::Auto).await.unwrap();
    assert!(fixture.provision_authority(Mode::Auto).await.unwrap().exported.is_empty());

    // Retrying cannot help, so the error must not ask for a retry.
    for _ in 0..2 {
        let err = fixture.provision_principal("server", Mode::Force).await.unwrap_err();
        assert_eq!(err.step, Step::ReadArtifacts);
        assert!(matches!(err.kind, ErrorKind::Import(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), exit::FAILURE);
    }
    assert!(fixture.layout().reexport_request_path("server").exists());

    let run = fixture.provision_authority(Mode::Auto).await.unwrap();
    assert_eq!(run.exported, vec!["server".to_string()]);
    assert!(run.outcome.unchanged());
    assert!(!fixture.layout().reexport_request_path("server").exists());

    let outcome = fixture.provision_principal("server", Mode::Force).await.unwrap();
    assert_eq!(outcome.state, ProvisioningState::Verified);
    assert!(!fixture.layout().password_path("server").exists());
}

#[tokio::test]
async fn test_lost_consumer_store_recovers_after_authority_rerun() {
    let fixture = DeploymentFixture::new();
    fixture.provision_all(Mode::Auto).await.unwrap();
    let before = {
        let bridge = fixture.store("bridge", Mode::Skip).unwrap();
        bridge.list_certificates().await.unwrap()
    };
    std::fs::remove_dir_all(fixture.deployment.store_dir(fixture.principal("client"))).unwrap();

    let err = fixture.provision_principal("client", Mode::Auto).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.step, Step::ReadArtifacts);

    let run = fixture.provision_authority(Mode::Auto).await.unwrap();
    assert_eq!(run.exported, vec!["client".to_string()]);

    let outcome = fixture.provision_principal("client", Mode::Auto).await.unwrap();
    assert_eq!(outcome.state, ProvisioningState::Verified);
    let client = fixture.store("client", Mode::Skip).unwrap();
    let leaf = client
        .record(&fixture.principal("client").leaf_nickname())
        .await
        .unwrap()
        .unwrap();
    assert!(leaf.has_private_key);
    drop(client);

    // The same leaf came back; the authority issued nothing new.
    let bridge = fixture.store("bridge", Mode::Skip).unwrap();
    assert_eq!(bridge.list_certificates().await.unwrap(), before);
    assert!(before.iter().any(|r| r.serial == leaf.serial));
    drop(bridge);
    assert!(fixture.provision_authority(Mode::Auto).await.unwrap().exported.is_empty());
}

#[tokio::test]
async fn test_forced_authority_recovers_unreadable_store() {
    let fixture = DeploymentFixture::new();
    fixture.provision_authority(Mode::Auto).await.unwrap();
    let db = fixture
        .deployment
        .store_dir(fixture.principal("bridge"))
        .join(sigul_pki::store::STORE_FILE);
    std::fs::write(&db, b"not a database").unwrap();

    let err = fixture.provision_authority(Mode::Auto).await.unwrap_err();
    assert_eq!(err.step, Step::OpenStore);
    assert!(!err.is_retryable());

    let run = fixture.provision_authority(Mode::Force).await.unwrap();
    assert_eq!(run.exported.len(), 3);
    assert_eq!(run.outcome.state, ProvisioningState::Verified);
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering and transport
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_consumer_before_authority_is_retryable() {
    let fixture = DeploymentFixture::new();

    let err = fixture.provision_principal("client", Mode::Auto).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.exit_code(), exit::RETRY);

    fixture.provision_authority(Mode::Auto).await.unwrap();
    let outcome = fixture.provision_principal("client", Mode::Auto).await.unwrap();
    assert_eq!(outcome.state, ProvisioningState::Verified);
}

#[tokio::test]
async fn test_transport_passwords_are_unique_and_private() {
    let fixture = DeploymentFixture::new();
    fixture.provision_authority(Mode::Auto).await.unwrap();

    let mut seen = HashSet::new();
    for principal in fixture.deployment.consumers() {
        let path = fixture.layout().password_path(&principal.name);
        let password = read_password(&path).unwrap();
        assert_ne!(password.expose(), fixture.password.expose());
        assert!(seen.insert(password.expose().to_string()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    // A second export never repeats a password.
    let bridge = fixture.store("bridge", Mode::Skip).unwrap();
    let bundles = ExportBundler::new(&fixture.password)
        .export_all(&bridge, &fixture.deployment.principals)
        .await
        .unwrap();
    for leaf in bundles.iter().filter_map(|b| b.leaf()) {
        assert!(seen.insert(leaf.transport_password.expose().to_string()));
    }
}

#[tokio::test]
async fn test_authority_key_never_exported() {
    let fixture = DeploymentFixture::new();
    fixture.provision_authority(Mode::Auto).await.unwrap();
    let bridge = fixture.store("bridge", Mode::Skip).unwrap();

    let password = sigul_pki_transport::TransportPassword::generate();
    let err = bridge.export_bundle(&authority_nickname(), &password).await;
    assert!(err.is_err());

    for path in fixture.artifact_files() {
        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("PRIVATE"), "{} looks like a key", path.display());
    }
}

#[tokio::test]
async fn test_second_process_is_locked_out() {
    let fixture = DeploymentFixture::new();
    let _held = fixture.store("bridge", Mode::Auto).unwrap();

    let err = fixture.provision_authority(Mode::Auto).await.unwrap_err();
    assert_eq!(err.step, Step::OpenStore);
    assert!(err.is_retryable());
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry and audit
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_expiry_is_reported() {
    let fixture = DeploymentFixture::with_config(|c| c.leaf_validity_months = 1);
    fixture.provision_all(Mode::Auto).await.unwrap();
    let server = fixture.store("server", Mode::Skip).unwrap();
    let expected = Expectation::for_principal(fixture.principal("server"));

    // Inside the warning window: a warning, not a failure.
    let report = InvariantValidator::new()
        .at(Utc::now() + Duration::days(20))
        .verify(&server, &expected)
        .await
        .unwrap();
    assert!(report.is_ok());
    assert!(report
        .warnings()
        .any(|f| matches!(f, Finding::ExpiringSoon { .. })));

    let err = InvariantValidator::new()
        .at(Utc::now() + Duration::days(90))
        .verify(&server, &expected)
        .await
        .unwrap()
        .into_result(Step::Verify)
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Expiry(_)));
}

#[tokio::test]
async fn test_deploy_audits_every_store() {
    let fixture = DeploymentFixture::new();
    let report = deploy(&fixture.deployment, &fixture.password, Mode::Auto)
        .await
        .unwrap();

    assert_eq!(report.audit.authority_key_holders, vec!["bridge".to_string()]);
    assert_eq!(report.audit.reports.len(), 3);
    assert!(report.audit.is_ok());
}
