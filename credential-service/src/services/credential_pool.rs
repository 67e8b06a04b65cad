//! Credential pool: lifecycle operations over stored provider credentials.
//!
//! Every status change goes through this module so the single-active
//! invariant per (provider, tier) is enforced in one place. `Activate` locks
//! the whole (provider, tier) group in credential-id order before demoting
//! and promoting, which serialises concurrent activations without deadlock;
//! the partial unique index `credentials_one_active_per_tier` backs it up.

use crate::models::{
    secret_prefix, Credential, CredentialFilter, CredentialStatus, NewCredential, Provider, Tier,
};
use crate::services::cipher::SecretCipher;
use crate::services::database::Database;
use crate::services::error::{db_err, ServiceError};
use crate::services::metrics::{DB_QUERY_DURATION, INTEGRITY_VIOLATIONS_TOTAL};
use chrono::Utc;
use secrecy::{ExposeSecret, Secret};
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const CREDENTIAL_COLUMNS: &str = "credential_id, provider, tier, label, secret, secret_prefix, \
     status, usage_count, last_used_utc, activated_utc, deactivated_utc, added_utc, added_by, notes";

/// Result of an activation: the promoted credential and everything demoted.
#[derive(Debug, Clone)]
pub struct Activation {
    pub credential: Credential,
    pub deactivated: Vec<Uuid>,
}

#[derive(Clone)]
pub struct CredentialPool {
    db: Database,
    cipher: Arc<dyn SecretCipher>,
}

impl CredentialPool {
    pub fn new(db: Database, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { db, cipher }
    }

    // -------------------------------------------------------------------------
    // Creation & reads
    // -------------------------------------------------------------------------

    /// Encrypt and store a new credential in `pending` state.
    #[instrument(skip(self, input), fields(provider = %input.provider, tier = %input.tier))]
    pub async fn add(&self, input: NewCredential) -> Result<Credential, ServiceError> {
        input.validate()?;

        let plaintext = input.secret.expose_secret();
        if plaintext.trim().is_empty() {
            return Err(ServiceError::Validation("secret must not be empty".into()));
        }

        let ciphertext = self.cipher.encrypt(plaintext.as_bytes())?;
        let prefix = secret_prefix(plaintext);

        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_credential"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO credentials (credential_id, provider, tier, label, secret, secret_prefix, status, added_utc, added_by, notes)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9)
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        );
        let credential = sqlx::query_as::<_, Credential>(&sql)
            .bind(Uuid::new_v4())
            .bind(input.provider.as_str())
            .bind(input.tier.as_str())
            .bind(&input.label)
            .bind(&ciphertext)
            .bind(&prefix)
            .bind(Utc::now())
            .bind(input.added_by)
            .bind(&input.notes)
            .fetch_one(self.db.pool())
            .await
            .map_err(db_err("Failed to add credential"))?;

        timer.observe_duration();

        info!(
            credential_id = %credential.credential_id,
            masked = %credential.masked(),
            "Credential added"
        );

        Ok(credential)
    }

    #[instrument(skip(self), fields(credential_id = %id))]
    pub async fn get(&self, id: Uuid) -> Result<Credential, ServiceError> {
        let mut conn = self.acquire().await?;
        fetch_by_id(&mut *conn, id, false)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Credential {}", id)))
    }

    /// List credentials ordered by provider, tier and age.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: CredentialFilter) -> Result<Vec<Credential>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credentials"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {CREDENTIAL_COLUMNS}
            FROM credentials
            WHERE ($1::varchar IS NULL OR provider = $1)
              AND ($2::varchar IS NULL OR tier = $2)
              AND ($3::varchar IS NULL OR status = $3)
            ORDER BY provider, tier, added_utc
            "#
        );
        let credentials = sqlx::query_as::<_, Credential>(&sql)
            .bind(filter.provider.map(|p| p.as_str()))
            .bind(filter.tier.map(|t| t.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err("Failed to list credentials"))?;

        timer.observe_duration();
        Ok(credentials)
    }

    /// Current active credential for the pair, if any. Never fails on
    /// duplicate actives: see [`get_active_in`].
    #[instrument(skip(self), fields(provider = %provider, tier = %tier))]
    pub async fn get_active(
        &self,
        provider: Provider,
        tier: Tier,
    ) -> Result<Option<Credential>, ServiceError> {
        let mut conn = self.acquire().await?;
        get_active_in(&mut *conn, provider, tier).await
    }

    /// Least-recently-activated pending or inactive credential for the pair.
    #[instrument(skip(self), fields(provider = %provider, tier = %tier))]
    pub async fn next_for_rotation(
        &self,
        provider: Provider,
        tier: Tier,
    ) -> Result<Option<Credential>, ServiceError> {
        let mut conn = self.acquire().await?;
        next_for_rotation_in(&mut *conn, provider, tier).await
    }

    // -------------------------------------------------------------------------
    // Lifecycle transitions
    // -------------------------------------------------------------------------

    /// Make `id` the single active credential of its (provider, tier).
    #[instrument(skip(self), fields(credential_id = %id))]
    pub async fn activate(&self, id: Uuid) -> Result<Activation, ServiceError> {
        let mut tx = self.db.begin().await?;
        let activation = activate_in(&mut *tx, id).await?;
        tx.commit()
            .await
            .map_err(db_err("Failed to commit activation"))?;
        Ok(activation)
    }

    /// `active`/`pending` → `inactive`. Deactivating an inactive credential
    /// is a no-op; a revoked one cannot be deactivated.
    #[instrument(skip(self), fields(credential_id = %id))]
    pub async fn deactivate(&self, id: Uuid) -> Result<Credential, ServiceError> {
        let mut tx = self.db.begin().await?;

        let current = fetch_by_id(&mut *tx, id, true)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Credential {}", id)))?;

        match current.status {
            CredentialStatus::Revoked => {
                return Err(ServiceError::InvalidTransition(format!(
                    "credential {} is revoked",
                    id
                )));
            }
            CredentialStatus::Inactive => return Ok(current),
            CredentialStatus::Active | CredentialStatus::Pending => {}
        }

        let credential = set_status(&mut *tx, id, CredentialStatus::Inactive).await?;
        tx.commit()
            .await
            .map_err(db_err("Failed to commit deactivation"))?;

        info!(
            provider = %credential.provider,
            tier = %credential.tier,
            "Credential deactivated"
        );
        Ok(credential)
    }

    /// Terminal transition. Revoking twice leaves the record unchanged.
    #[instrument(skip(self), fields(credential_id = %id))]
    pub async fn revoke(&self, id: Uuid) -> Result<Credential, ServiceError> {
        let mut tx = self.db.begin().await?;

        let current = fetch_by_id(&mut *tx, id, true)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Credential {}", id)))?;

        if current.status.is_terminal() {
            return Ok(current);
        }

        let credential = set_status(&mut *tx, id, CredentialStatus::Revoked).await?;
        tx.commit()
            .await
            .map_err(db_err("Failed to commit revocation"))?;

        warn!(
            provider = %credential.provider,
            tier = %credential.tier,
            masked = %credential.masked(),
            "Credential revoked"
        );
        Ok(credential)
    }

    #[instrument(skip(self), fields(credential_id = %id))]
    pub async fn record_usage(&self, id: Uuid) -> Result<(), ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_usage"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET usage_count = usage_count + 1, last_used_utc = $2
            WHERE credential_id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(db_err("Failed to record usage"))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("Credential {}", id)));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Secret access
    // -------------------------------------------------------------------------

    /// Decrypt a stored secret.
    #[instrument(skip(self), fields(credential_id = %id))]
    pub async fn reveal_secret(&self, id: Uuid) -> Result<Secret<String>, ServiceError> {
        let credential = self.get(id).await?;
        self.decrypt(&credential)
    }

    /// Plaintext of the active credential for the pair; counts as a use.
    #[instrument(skip(self), fields(provider = %provider, tier = %tier))]
    pub async fn reveal_active(
        &self,
        provider: Provider,
        tier: Tier,
    ) -> Result<Option<(Credential, Secret<String>)>, ServiceError> {
        let Some(credential) = self.get_active(provider, tier).await? else {
            return Ok(None);
        };
        let secret = self.decrypt(&credential)?;
        self.record_usage(credential.credential_id).await?;
        Ok(Some((credential, secret)))
    }

    fn decrypt(&self, credential: &Credential) -> Result<Secret<String>, ServiceError> {
        let bytes = self.cipher.decrypt(&credential.secret)?;
        let plaintext = String::from_utf8(bytes).map_err(|_| ServiceError::DecryptionFailed)?;
        Ok(Secret::new(plaintext))
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, ServiceError> {
        self.db
            .pool()
            .acquire()
            .await
            .map_err(db_err("Failed to acquire connection"))
    }
}

// -----------------------------------------------------------------------------
// Connection-scoped operations, shared with the rotation engine so rotations
// run inside the engine's own transaction.
// -----------------------------------------------------------------------------

async fn fetch_by_id(
    conn: &mut PgConnection,
    id: Uuid,
    for_update: bool,
) -> Result<Option<Credential>, ServiceError> {
    let sql = format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE credential_id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, Credential>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch credential"))
}

/// Active credential for the pair. If history left more than one active row,
/// the most recently activated wins and the anomaly is logged and counted.
pub(crate) async fn get_active_in(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
) -> Result<Option<Credential>, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["get_active_credential"])
        .start_timer();

    let sql = format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS}
        FROM credentials
        WHERE provider = $1 AND tier = $2 AND status = 'active'
        ORDER BY activated_utc DESC NULLS LAST, added_utc DESC
        "#
    );
    let mut active = sqlx::query_as::<_, Credential>(&sql)
        .bind(provider.as_str())
        .bind(tier.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch active credential"))?;

    timer.observe_duration();

    if active.len() > 1 {
        INTEGRITY_VIOLATIONS_TOTAL
            .with_label_values(&[provider.as_str(), tier.as_str()])
            .inc();
        warn!(
            provider = %provider,
            tier = %tier,
            active_count = active.len(),
            chosen = %active[0].credential_id,
            "Multiple active credentials found, using most recently activated"
        );
    }

    if active.is_empty() {
        Ok(None)
    } else {
        Ok(Some(active.swap_remove(0)))
    }
}

/// Round-robin by recency: never-activated first, then oldest activation,
/// ties broken by oldest `added_utc`.
pub(crate) async fn next_for_rotation_in(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
) -> Result<Option<Credential>, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["next_for_rotation"])
        .start_timer();

    let sql = format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS}
        FROM credentials
        WHERE provider = $1 AND tier = $2 AND status IN ('pending', 'inactive')
        ORDER BY activated_utc ASC NULLS FIRST, added_utc ASC
        LIMIT 1
        "#
    );
    let candidate = sqlx::query_as::<_, Credential>(&sql)
        .bind(provider.as_str())
        .bind(tier.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch rotation candidate"))?;

    timer.observe_duration();
    Ok(candidate)
}

/// Demote every other active credential of the pair, then promote `id`.
/// Must run inside a transaction.
pub(crate) async fn activate_in(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Activation, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["activate_credential"])
        .start_timer();

    let target = fetch_by_id(conn, id, false)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Credential {}", id)))?;

    // Lock the whole group in a stable order.
    let group: Vec<(Uuid, CredentialStatus)> = sqlx::query_as(
        r#"
        SELECT credential_id, status
        FROM credentials
        WHERE provider = $1 AND tier = $2
        ORDER BY credential_id
        FOR UPDATE
        "#,
    )
    .bind(target.provider.as_str())
    .bind(target.tier.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("Failed to lock credential group"))?;

    let status = group
        .iter()
        .find(|(cid, _)| *cid == id)
        .map(|(_, status)| *status)
        .ok_or_else(|| ServiceError::NotFound(format!("Credential {}", id)))?;

    if status.is_terminal() {
        return Err(ServiceError::InvalidTransition(format!(
            "credential {} is revoked and cannot be activated",
            id
        )));
    }

    let now = Utc::now();

    let deactivated: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE credentials
        SET status = 'inactive', deactivated_utc = $4
        WHERE provider = $1 AND tier = $2 AND status = 'active' AND credential_id <> $3
        RETURNING credential_id
        "#,
    )
    .bind(target.provider.as_str())
    .bind(target.tier.as_str())
    .bind(id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("Failed to demote active credentials"))?;

    // Re-activating the current credential keeps its activation time.
    let sql = format!(
        r#"
        UPDATE credentials
        SET status = 'active',
            activated_utc = CASE WHEN status = 'active' THEN activated_utc ELSE $2 END
        WHERE credential_id = $1
        RETURNING {CREDENTIAL_COLUMNS}
        "#
    );
    let credential = sqlx::query_as::<_, Credential>(&sql)
        .bind(id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("Failed to activate credential"))?;

    timer.observe_duration();

    info!(
        credential_id = %credential.credential_id,
        provider = %credential.provider,
        tier = %credential.tier,
        demoted = deactivated.len(),
        "Credential activated"
    );

    Ok(Activation {
        credential,
        deactivated,
    })
}

async fn set_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: CredentialStatus,
) -> Result<Credential, ServiceError> {
    let sql = format!(
        r#"
        UPDATE credentials
        SET status = $2,
            deactivated_utc = CASE WHEN status = 'active' THEN $3 ELSE deactivated_utc END
        WHERE credential_id = $1
        RETURNING {CREDENTIAL_COLUMNS}
        "#
    );
    sqlx::query_as::<_, Credential>(&sql)
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("Failed to update credential status"))
}
