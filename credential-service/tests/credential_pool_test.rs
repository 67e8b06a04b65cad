//! Credential pool integration tests.
//!
//! Run with: ./scripts/integ-tests.sh -p credential-service

mod common;

use common::{add_active_credential, add_credential, new_credential, spawn_services, test_db};
use credential_service::models::{CredentialFilter, CredentialStatus, Provider, Tier};
use credential_service::services::ServiceError;
use secrecy::{ExposeSecret, Secret};
use uuid::Uuid;

#[tokio::test]
#[ignore] // Requires database - run with integ-tests.sh
async fn add_credential_encrypts_and_masks_secret() {
    let services = spawn_services().await;

    let credential = add_credential(
        &services,
        Provider::OpenAi,
        Tier::Premium,
        "sk-proj-abcdefghijklmnop",
    )
    .await;

    assert_eq!(credential.status, CredentialStatus::Pending);
    assert_eq!(credential.secret_prefix, "sk-proj-");
    assert_eq!(credential.masked(), "sk-proj-...****");
    assert_eq!(credential.usage_count, 0);
    assert!(credential.activated_utc.is_none());

    // Stored bytes are ciphertext, never the plaintext
    assert_ne!(credential.secret, b"sk-proj-abcdefghijklmnop".to_vec());

    let revealed = services
        .pool
        .reveal_secret(credential.credential_id)
        .await
        .unwrap();
    assert_eq!(revealed.expose_secret(), "sk-proj-abcdefghijklmnop");
}

#[tokio::test]
#[ignore]
async fn add_credential_rejects_empty_secret_and_label() {
    let services = spawn_services().await;

    let err = services
        .pool
        .add(new_credential(Provider::OpenAi, Tier::Premium, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let mut input = new_credential(Provider::OpenAi, Tier::Premium, "sk-valid-secret-1");
    input.label = String::new();
    let err = services.pool.add(input).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
#[ignore]
async fn activate_demotes_previous_active() {
    let services = spawn_services().await;

    let first = add_active_credential(&services, Provider::Anthropic, Tier::Standard, "sk-ant-first-000").await;
    let second = add_credential(&services, Provider::Anthropic, Tier::Standard, "sk-ant-second-00").await;

    let activation = services.pool.activate(second.credential_id).await.unwrap();

    assert_eq!(activation.credential.status, CredentialStatus::Active);
    assert_eq!(activation.deactivated, vec![first.credential_id]);

    let first = services.pool.get(first.credential_id).await.unwrap();
    assert_eq!(first.status, CredentialStatus::Inactive);
    assert!(first.deactivated_utc.is_some());

    let active = services
        .pool
        .get_active(Provider::Anthropic, Tier::Standard)
        .await
        .unwrap()
        .expect("Should have an active credential");
    assert_eq!(active.credential_id, second.credential_id);
}

#[tokio::test]
#[ignore]
async fn activation_is_scoped_to_provider_and_tier() {
    let services = spawn_services().await;

    let premium = add_active_credential(&services, Provider::OpenAi, Tier::Premium, "sk-premium-0001").await;
    let other_provider =
        add_active_credential(&services, Provider::Anthropic, Tier::Premium, "sk-ant-prem-001").await;
    let fallback = add_credential(&services, Provider::OpenAi, Tier::Fallback, "sk-fallback-001").await;

    let activation = services.pool.activate(fallback.credential_id).await.unwrap();
    assert!(activation.deactivated.is_empty());

    for id in [premium.credential_id, other_provider.credential_id] {
        let credential = services.pool.get(id).await.unwrap();
        assert_eq!(credential.status, CredentialStatus::Active);
    }
}

#[tokio::test]
#[ignore]
async fn reactivating_active_credential_keeps_activation_time() {
    let services = spawn_services().await;

    let credential = add_active_credential(&services, Provider::Google, Tier::Premium, "AIzaSyExample01").await;
    let again = services.pool.activate(credential.credential_id).await.unwrap();

    assert!(again.deactivated.is_empty());
    assert_eq!(again.credential.activated_utc, credential.activated_utc);
}

#[tokio::test]
#[ignore]
async fn concurrent_activations_leave_single_active() {
    let services = spawn_services().await;

    let mut ids = Vec::new();
    for i in 0..4 {
        let credential = add_credential(
            &services,
            Provider::OpenAi,
            Tier::Standard,
            &format!("sk-concurrent-{:04}", i),
        )
        .await;
        ids.push(credential.credential_id);
    }

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let pool = services.pool.clone();
            tokio::spawn(async move { pool.activate(id).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().expect("Activation should succeed");
    }

    let active = services
        .pool
        .list(CredentialFilter {
            provider: Some(Provider::OpenAi),
            tier: Some(Tier::Standard),
            status: Some(CredentialStatus::Active),
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
#[ignore]
async fn revoked_credential_is_terminal() {
    let services = spawn_services().await;

    let credential = add_active_credential(&services, Provider::ElevenLabs, Tier::Premium, "el-secret-00001").await;

    let revoked = services.pool.revoke(credential.credential_id).await.unwrap();
    assert_eq!(revoked.status, CredentialStatus::Revoked);
    assert!(revoked.deactivated_utc.is_some());

    // Revoking twice is a no-op
    let again = services.pool.revoke(credential.credential_id).await.unwrap();
    assert_eq!(again.status, CredentialStatus::Revoked);

    let err = services
        .pool
        .activate(credential.credential_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTransition(_)));

    let err = services
        .pool
        .deactivate(credential.credential_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTransition(_)));

    assert!(services
        .pool
        .get_active(Provider::ElevenLabs, Tier::Premium)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore]
async fn deactivate_is_idempotent() {
    let services = spawn_services().await;

    let credential = add_active_credential(&services, Provider::OpenAi, Tier::Premium, "sk-deactivate-1").await;

    let first = services.pool.deactivate(credential.credential_id).await.unwrap();
    assert_eq!(first.status, CredentialStatus::Inactive);

    let second = services.pool.deactivate(credential.credential_id).await.unwrap();
    assert_eq!(second.status, CredentialStatus::Inactive);
    assert_eq!(second.deactivated_utc, first.deactivated_utc);
}

#[tokio::test]
#[ignore]
async fn next_for_rotation_prefers_never_activated_then_oldest() {
    let services = spawn_services().await;

    let a = add_active_credential(&services, Provider::OpenAi, Tier::Fallback, "sk-fallback-aaa").await;
    let b = add_active_credential(&services, Provider::OpenAi, Tier::Fallback, "sk-fallback-bbb").await;
    let fresh = add_credential(&services, Provider::OpenAi, Tier::Fallback, "sk-fallback-new").await;

    // Never activated wins
    let next = services
        .pool
        .next_for_rotation(Provider::OpenAi, Tier::Fallback)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.credential_id, fresh.credential_id);

    // Then the least recently activated inactive one
    services.pool.revoke(fresh.credential_id).await.unwrap();
    let next = services
        .pool
        .next_for_rotation(Provider::OpenAi, Tier::Fallback)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.credential_id, a.credential_id);

    // The active one is never a candidate
    services.pool.revoke(a.credential_id).await.unwrap();
    let next = services
        .pool
        .next_for_rotation(Provider::OpenAi, Tier::Fallback)
        .await
        .unwrap();
    assert!(next.is_none());
    assert!(services.pool.get(b.credential_id).await.unwrap().is_active());
}

#[tokio::test]
#[ignore]
async fn list_applies_filters() {
    let services = spawn_services().await;

    add_active_credential(&services, Provider::OpenAi, Tier::Premium, "sk-list-premium").await;
    add_credential(&services, Provider::OpenAi, Tier::Fallback, "sk-list-fallbck").await;
    add_credential(&services, Provider::Anthropic, Tier::Premium, "sk-ant-list-prm").await;

    let all = services.pool.list(CredentialFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let openai = services
        .pool
        .list(CredentialFilter {
            provider: Some(Provider::OpenAi),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(openai.len(), 2);

    let pending_premium = services
        .pool
        .list(CredentialFilter {
            tier: Some(Tier::Premium),
            status: Some(CredentialStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending_premium.len(), 1);
    assert_eq!(pending_premium[0].provider, Provider::Anthropic);
}

#[tokio::test]
#[ignore]
async fn reveal_active_records_usage() {
    let services = spawn_services().await;

    let credential = add_active_credential(&services, Provider::OpenAi, Tier::Premium, "sk-reveal-active").await;

    let (active, secret) = services
        .pool
        .reveal_active(Provider::OpenAi, Tier::Premium)
        .await
        .unwrap()
        .expect("Should reveal the active credential");
    assert_eq!(active.credential_id, credential.credential_id);
    assert_eq!(secret.expose_secret(), "sk-reveal-active");

    let after = services.pool.get(credential.credential_id).await.unwrap();
    assert_eq!(after.usage_count, 1);
    assert!(after.last_used_utc.is_some());

    assert!(services
        .pool
        .reveal_active(Provider::OpenAi, Tier::Standard)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore]
async fn unknown_credential_is_not_found() {
    let services = spawn_services().await;
    let id = Uuid::new_v4();

    assert!(matches!(
        services.pool.get(id).await.unwrap_err(),
        ServiceError::NotFound(_)
    ));
    assert!(matches!(
        services.pool.activate(id).await.unwrap_err(),
        ServiceError::NotFound(_)
    ));
    assert!(matches!(
        services.pool.record_usage(id).await.unwrap_err(),
        ServiceError::NotFound(_)
    ));
}

#[tokio::test]
#[ignore]
async fn secret_encrypted_under_other_key_fails_to_decrypt() {
    let db = test_db().await;
    let services = common::services_with(db.clone(), Default::default());
    let credential = add_credential(&services, Provider::OpenAi, Tier::Premium, "sk-other-key-01").await;

    let other_cipher = std::sync::Arc::new(
        credential_service::services::XChaChaCipher::from_base64_key(&Secret::new(
            "//////////////////////////////////////////8=".to_string(),
        ))
        .unwrap(),
    );
    let other = credential_service::services::CredentialServices::new(
        db,
        other_cipher,
        Default::default(),
        Default::default(),
    );

    let err = other
        .pool
        .reveal_secret(credential.credential_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::DecryptionFailed));
}

#[tokio::test]
#[ignore]
async fn duplicate_active_rows_resolve_to_most_recent() {
    let db = test_db().await;
    let services = common::services_with(db.clone(), Default::default());

    let older = add_active_credential(&services, Provider::OpenAi, Tier::Premium, "sk-dup-older-01").await;
    let newer = add_credential(&services, Provider::OpenAi, Tier::Premium, "sk-dup-newer-01").await;

    // Simulate a legacy store without the partial unique index
    sqlx::query("DROP INDEX credentials_one_active_per_tier")
        .execute(db.pool())
        .await
        .unwrap();
    sqlx::query(
        "UPDATE credentials SET status = 'active', activated_utc = NOW() + INTERVAL '1 second' \
         WHERE credential_id = $1",
    )
    .bind(newer.credential_id)
    .execute(db.pool())
    .await
    .unwrap();

    let active = services
        .pool
        .get_active(Provider::OpenAi, Tier::Premium)
        .await
        .unwrap()
        .expect("Should still resolve an active credential");
    assert_eq!(active.credential_id, newer.credential_id);

    // Activation repairs the pair back to a single active row
    services.pool.activate(older.credential_id).await.unwrap();
    let active = services
        .pool
        .list(CredentialFilter {
            provider: Some(Provider::OpenAi),
            tier: Some(Tier::Premium),
            status: Some(CredentialStatus::Active),
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].credential_id, older.credential_id);
}
