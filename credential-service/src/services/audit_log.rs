//! Append-only rotation audit log.
//!
//! Entries are insert-only. A table trigger rejects UPDATE and DELETE.

use crate::models::{NewRotationLog, Provider, RotationLog};
use crate::services::database::Database;
use crate::services::error::{db_err, ServiceError};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::Utc;
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

pub const DEFAULT_RECENT_LIMIT: i64 = 50;
pub const MAX_RECENT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, entry), fields(provider = %entry.provider, status = entry.status.as_str()))]
    pub async fn append(&self, entry: &NewRotationLog) -> Result<RotationLog, ServiceError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(db_err("Failed to acquire connection"))?;
        append_in(&mut *conn, entry).await
    }

    /// Most recent entries first, optionally for one provider.
    #[instrument(skip(self))]
    pub async fn recent(
        &self,
        provider: Option<Provider>,
        limit: Option<i64>,
    ) -> Result<Vec<RotationLog>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recent_rotation_logs"])
            .start_timer();

        let limit = clamp_limit(limit);

        let logs = sqlx::query_as::<_, RotationLog>(
            r#"
            SELECT log_id, provider, tier, old_credential_id, new_credential_id, old_masked, new_masked,
                   status, rotation_type, rotated_by, error_message, notes, rotated_utc
            FROM rotation_logs
            WHERE ($1::varchar IS NULL OR provider = $1)
            ORDER BY rotated_utc DESC, log_id
            LIMIT $2
            "#,
        )
        .bind(provider.map(|p| p.as_str()))
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err("Failed to fetch rotation logs"))?;

        timer.observe_duration();
        Ok(logs)
    }
}

/// Append within the caller's transaction.
pub(crate) async fn append_in(
    conn: &mut PgConnection,
    entry: &NewRotationLog,
) -> Result<RotationLog, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["append_rotation_log"])
        .start_timer();

    let log = sqlx::query_as::<_, RotationLog>(
        r#"
        INSERT INTO rotation_logs (log_id, provider, tier, old_credential_id, new_credential_id, old_masked, new_masked,
                                   status, rotation_type, rotated_by, error_message, notes, rotated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING log_id, provider, tier, old_credential_id, new_credential_id, old_masked, new_masked,
                  status, rotation_type, rotated_by, error_message, notes, rotated_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.provider.as_str())
    .bind(entry.tier.map(|t| t.as_str()))
    .bind(entry.old_credential_id)
    .bind(entry.new_credential_id)
    .bind(&entry.old_masked)
    .bind(&entry.new_masked)
    .bind(entry.status.as_str())
    .bind(entry.rotation_type.as_str())
    .bind(entry.rotated_by)
    .bind(&entry.error_message)
    .bind(&entry.notes)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err("Failed to append rotation log"))?;

    timer.observe_duration();

    debug!(
        log_id = %log.log_id,
        rotation_type = log.rotation_type.as_str(),
        "Rotation log appended"
    );

    Ok(log)
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(n) if n > 0 => n.min(MAX_RECENT_LIMIT),
        _ => DEFAULT_RECENT_LIMIT,
    }
}
