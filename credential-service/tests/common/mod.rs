//! Common test utilities for credential-service integration tests.
//!
//! Every call to [`test_db`] gets its own PostgreSQL schema, so tests that
//! touch global state (the spending cap, the current month) stay isolated.

#![allow(dead_code)]

use credential_service::models::{Credential, NewCredential, Provider, Tier};
use credential_service::services::{
    CredentialServices, Database, RotationSettings, SecretCipher, TierThresholds, XChaChaCipher,
};
use secrecy::Secret;
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 32 bytes 0x00..0x1f, base64.
pub const TEST_ENCRYPTION_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

static SCHEMA_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn init_tracing() {
    service_core::observability::init_test_tracing("info,credential_service=debug,sqlx=warn");
}

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set - use scripts/integ-tests.sh to run tests")
}

/// Fresh, migrated schema behind a small pool.
pub async fn test_db() -> Database {
    init_tracing();

    let url = database_url();
    let schema = format!(
        "test_credential_{}_{}",
        std::process::id(),
        SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
    );

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    admin
        .execute(format!("DROP SCHEMA IF EXISTS {schema} CASCADE").as_str())
        .await
        .expect("Failed to drop stale schema");
    admin
        .execute(format!("CREATE SCHEMA {schema}").as_str())
        .await
        .expect("Failed to create test schema");
    admin.close().await;

    let search_path = format!("SET search_path TO {schema}");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let sql = search_path.clone();
            Box::pin(async move {
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("Failed to connect test pool");

    let db = Database::from_pool(pool);
    db.run_migrations().await.expect("Failed to run migrations");
    db
}

pub fn test_cipher() -> Arc<dyn SecretCipher> {
    Arc::new(
        XChaChaCipher::from_base64_key(&Secret::new(TEST_ENCRYPTION_KEY.to_string()))
            .expect("Test key must be valid"),
    )
}

pub fn services_with(db: Database, rotation: RotationSettings) -> CredentialServices {
    CredentialServices::new(db, test_cipher(), rotation, TierThresholds::default())
}

/// Services over a fresh schema with default settings.
pub async fn spawn_services() -> CredentialServices {
    services_with(test_db().await, RotationSettings::default())
}

pub fn new_credential(provider: Provider, tier: Tier, secret: &str) -> NewCredential {
    NewCredential {
        provider,
        tier,
        label: format!("{}-{}", provider, tier),
        secret: Secret::new(secret.to_string()),
        added_by: None,
        notes: None,
    }
}

pub async fn add_credential(
    services: &CredentialServices,
    provider: Provider,
    tier: Tier,
    secret: &str,
) -> Credential {
    services
        .pool
        .add(new_credential(provider, tier, secret))
        .await
        .expect("Failed to add credential")
}

/// Add and activate in one step.
pub async fn add_active_credential(
    services: &CredentialServices,
    provider: Provider,
    tier: Tier,
    secret: &str,
) -> Credential {
    let credential = add_credential(services, provider, tier, secret).await;
    services
        .pool
        .activate(credential.credential_id)
        .await
        .expect("Failed to activate credential")
        .credential
}
