//! Per (provider, tier) rotation schedules.

use crate::models::{
    compute_next_rotation, Provider, RotationFrequency, RotationSchedule, Tier, UpdateSchedule,
};
use crate::services::database::Database;
use crate::services::error::{db_err, ServiceError};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

const SCHEDULE_COLUMNS: &str = "schedule_id, provider, tier, enabled, frequency, last_rotation_utc, \
     next_rotation_utc, notify_before_days, notify_emails, owner_id, created_utc, updated_utc";

#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch the schedule, creating a disabled weekly one if absent.
    /// The flag is `true` when this call created it.
    #[instrument(skip(self), fields(provider = %provider, tier = %tier))]
    pub async fn get_or_create(
        &self,
        provider: Provider,
        tier: Tier,
    ) -> Result<(RotationSchedule, bool), ServiceError> {
        let mut tx = self.db.begin().await?;
        let result = get_or_create_in(&mut *tx, provider, tier, false).await?;
        tx.commit()
            .await
            .map_err(db_err("Failed to commit schedule creation"))?;
        Ok(result)
    }

    /// Save new settings; `next_rotation_utc` is recomputed from the last
    /// rotation (or now).
    #[instrument(skip(self, update), fields(provider = %provider, tier = %tier))]
    pub async fn update(
        &self,
        provider: Provider,
        tier: Tier,
        update: UpdateSchedule,
    ) -> Result<RotationSchedule, ServiceError> {
        if update.notify_before_days < 0 {
            return Err(ServiceError::Validation(
                "notify_before_days must not be negative".into(),
            ));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_schedule"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        let (current, _) = get_or_create_in(&mut *tx, provider, tier, true).await?;

        let now = Utc::now();
        let next = compute_next_rotation(update.frequency, current.last_rotation_utc, now);

        let sql = format!(
            r#"
            UPDATE rotation_schedules
            SET enabled = $2, frequency = $3, notify_before_days = $4, notify_emails = $5,
                owner_id = $6, next_rotation_utc = $7, updated_utc = $8
            WHERE schedule_id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );
        let schedule = sqlx::query_as::<_, RotationSchedule>(&sql)
            .bind(current.schedule_id)
            .bind(update.enabled)
            .bind(update.frequency.as_str())
            .bind(update.notify_before_days)
            .bind(&update.notify_emails)
            .bind(update.owner_id)
            .bind(next)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("Failed to update schedule"))?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit schedule update"))?;

        timer.observe_duration();

        info!(
            enabled = schedule.enabled,
            frequency = schedule.frequency.as_str(),
            next_rotation = ?schedule.next_rotation_utc,
            "Rotation schedule updated"
        );

        Ok(schedule)
    }

    /// Enabled schedules due at `now`, most overdue first.
    #[instrument(skip(self))]
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<RotationSchedule>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_schedules"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM rotation_schedules
            WHERE enabled AND (next_rotation_utc IS NULL OR next_rotation_utc <= $1)
            ORDER BY next_rotation_utc ASC NULLS FIRST
            "#
        );
        let schedules = sqlx::query_as::<_, RotationSchedule>(&sql)
            .bind(now)
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err("Failed to list due schedules"))?;

        timer.observe_duration();

        Ok(schedules.into_iter().filter(|s| s.is_due(now)).collect())
    }
}

async fn get_or_create_in(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
    for_update: bool,
) -> Result<(RotationSchedule, bool), ServiceError> {
    let now = Utc::now();
    let frequency = RotationFrequency::default();

    let sql = format!(
        r#"
        INSERT INTO rotation_schedules (schedule_id, provider, tier, enabled, frequency, next_rotation_utc, created_utc, updated_utc)
        VALUES ($1, $2, $3, FALSE, $4, $5, $6, $6)
        ON CONFLICT (provider, tier) DO NOTHING
        RETURNING {SCHEDULE_COLUMNS}
        "#
    );
    let inserted = sqlx::query_as::<_, RotationSchedule>(&sql)
        .bind(Uuid::new_v4())
        .bind(provider.as_str())
        .bind(tier.as_str())
        .bind(frequency.as_str())
        .bind(compute_next_rotation(frequency, None, now))
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to create schedule"))?;

    // A freshly inserted row is already locked by this transaction.
    if let Some(schedule) = inserted {
        info!(provider = %provider, tier = %tier, "Rotation schedule created");
        return Ok((schedule, true));
    }

    let existing = fetch_in(conn, provider, tier, for_update)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Rotation schedule {}/{}", provider, tier)))?;
    Ok((existing, false))
}

pub(crate) async fn fetch_in(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
    for_update: bool,
) -> Result<Option<RotationSchedule>, ServiceError> {
    let sql = format!(
        "SELECT {SCHEDULE_COLUMNS} FROM rotation_schedules WHERE provider = $1 AND tier = $2{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, RotationSchedule>(&sql)
        .bind(provider.as_str())
        .bind(tier.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch schedule"))
}

/// Record a completed rotation on the pair's schedule, if it has one.
pub(crate) async fn mark_rotated_in(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
    at: DateTime<Utc>,
) -> Result<Option<RotationSchedule>, ServiceError> {
    let Some(current) = fetch_in(conn, provider, tier, true).await? else {
        return Ok(None);
    };

    let next = compute_next_rotation(current.frequency, Some(at), at);

    let sql = format!(
        r#"
        UPDATE rotation_schedules
        SET last_rotation_utc = $2, next_rotation_utc = $3, updated_utc = $2
        WHERE schedule_id = $1
        RETURNING {SCHEDULE_COLUMNS}
        "#
    );
    let schedule = sqlx::query_as::<_, RotationSchedule>(&sql)
        .bind(current.schedule_id)
        .bind(at)
        .bind(next)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("Failed to mark schedule rotated"))?;

    Ok(Some(schedule))
}
