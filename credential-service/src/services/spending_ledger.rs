//! Monthly spending ledger and the organisation-wide spending cap.

use crate::models::{CapStatus, MonthlySpending, SpendCategory, SpendDelta, SpendingCap, Tier};
use crate::services::database::Database;
use crate::services::error::{db_err, ServiceError};
use crate::services::metrics::{DB_QUERY_DURATION, SPEND_RECORDED_TOTAL};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const DEFAULT_HISTORY_MONTHS: i64 = 6;
pub const MAX_HISTORY_MONTHS: i64 = 36;

const MONTH_COLUMNS: &str = "year, month, total_cost, llm_cost, tts_cost, other_cost, premium_cost, \
     standard_cost, fallback_cost, total_requests, llm_requests, tts_requests, other_requests, \
     premium_requests, standard_requests, fallback_requests, created_utc, updated_utc";

const CAP_COLUMNS: &str = "cap_id, amount_usd, is_active, created_by, created_utc, updated_utc";

/// Notified after every committed cost event.
///
/// Implementations must not propagate failures: the cost is already
/// recorded when this runs.
#[async_trait]
pub trait LedgerObserver: Send + Sync {
    async fn on_ledger_changed(&self);
}

#[derive(Clone)]
pub struct SpendingLedger {
    db: Database,
    observer: Option<Arc<dyn LedgerObserver>>,
}

impl SpendingLedger {
    pub fn new(db: Database) -> Self {
        Self { db, observer: None }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LedgerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    // -------------------------------------------------------------------------
    // Monthly totals
    // -------------------------------------------------------------------------

    /// This month's record, created on first access.
    #[instrument(skip(self))]
    pub async fn current_month(&self) -> Result<MonthlySpending, ServiceError> {
        let mut conn = self.acquire().await?;
        current_month_in(&mut *conn, Utc::now()).await
    }

    /// External entry point for the cost-recording pipeline.
    #[instrument(skip(self), fields(category = category.as_str()))]
    pub async fn record_spend(
        &self,
        amount: Decimal,
        category: SpendCategory,
        tier: Option<Tier>,
    ) -> Result<MonthlySpending, ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::Validation(
                "amount_usd must not be negative".into(),
            ));
        }
        self.add_cost(amount, category, tier).await
    }

    /// Atomically add one cost event to this month's counters, then notify
    /// the observer.
    #[instrument(skip(self), fields(category = category.as_str()))]
    pub async fn add_cost(
        &self,
        amount: Decimal,
        category: SpendCategory,
        tier: Option<Tier>,
    ) -> Result<MonthlySpending, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_cost"])
            .start_timer();

        let now = Utc::now();
        let (year, month) = year_month(now);
        let delta = SpendDelta::for_event(amount, category, tier);

        let sql = format!(
            r#"
            INSERT INTO monthly_spending (
                year, month, total_cost, llm_cost, tts_cost, other_cost,
                premium_cost, standard_cost, fallback_cost,
                total_requests, llm_requests, tts_requests, other_requests,
                premium_requests, standard_requests, fallback_requests,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1, $10, $11, $12, $13, $14, $15, $16, $16)
            ON CONFLICT (year, month) DO UPDATE SET
                total_cost = monthly_spending.total_cost + EXCLUDED.total_cost,
                llm_cost = monthly_spending.llm_cost + EXCLUDED.llm_cost,
                tts_cost = monthly_spending.tts_cost + EXCLUDED.tts_cost,
                other_cost = monthly_spending.other_cost + EXCLUDED.other_cost,
                premium_cost = monthly_spending.premium_cost + EXCLUDED.premium_cost,
                standard_cost = monthly_spending.standard_cost + EXCLUDED.standard_cost,
                fallback_cost = monthly_spending.fallback_cost + EXCLUDED.fallback_cost,
                total_requests = monthly_spending.total_requests + 1,
                llm_requests = monthly_spending.llm_requests + EXCLUDED.llm_requests,
                tts_requests = monthly_spending.tts_requests + EXCLUDED.tts_requests,
                other_requests = monthly_spending.other_requests + EXCLUDED.other_requests,
                premium_requests = monthly_spending.premium_requests + EXCLUDED.premium_requests,
                standard_requests = monthly_spending.standard_requests + EXCLUDED.standard_requests,
                fallback_requests = monthly_spending.fallback_requests + EXCLUDED.fallback_requests,
                updated_utc = EXCLUDED.updated_utc
            RETURNING {MONTH_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, MonthlySpending>(&sql)
            .bind(year)
            .bind(month)
            .bind(delta.total_cost)
            .bind(delta.llm_cost)
            .bind(delta.tts_cost)
            .bind(delta.other_cost)
            .bind(delta.premium_cost)
            .bind(delta.standard_cost)
            .bind(delta.fallback_cost)
            .bind(delta.llm_requests)
            .bind(delta.tts_requests)
            .bind(delta.other_requests)
            .bind(delta.premium_requests)
            .bind(delta.standard_requests)
            .bind(delta.fallback_requests)
            .bind(now)
            .fetch_one(self.db.pool())
            .await
            .map_err(db_err("Failed to record cost"))?;

        timer.observe_duration();

        SPEND_RECORDED_TOTAL
            .with_label_values(&[category.as_str()])
            .inc();

        debug!(
            amount = %amount,
            total = %updated.total_cost,
            "Cost recorded"
        );

        if let Some(observer) = &self.observer {
            observer.on_ledger_changed().await;
        }

        Ok(updated)
    }

    /// Most recent months first.
    #[instrument(skip(self))]
    pub async fn history(&self, months: Option<i64>) -> Result<Vec<MonthlySpending>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["spending_history"])
            .start_timer();

        let limit = match months {
            Some(n) if n > 0 => n.min(MAX_HISTORY_MONTHS),
            _ => DEFAULT_HISTORY_MONTHS,
        };

        let sql = format!(
            r#"
            SELECT {MONTH_COLUMNS}
            FROM monthly_spending
            ORDER BY year DESC, month DESC
            LIMIT $1
            "#
        );
        let history = sqlx::query_as::<_, MonthlySpending>(&sql)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err("Failed to fetch spending history"))?;

        timer.observe_duration();
        Ok(history)
    }

    // -------------------------------------------------------------------------
    // Spending cap
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn active_cap(&self) -> Result<Option<SpendingCap>, ServiceError> {
        let mut conn = self.acquire().await?;
        active_cap_in(&mut *conn).await
    }

    /// Replace the active cap: every active cap is deactivated and the new
    /// one inserted in the same transaction.
    #[instrument(skip(self), fields(amount_usd = %amount))]
    pub async fn set_cap(
        &self,
        amount: Decimal,
        created_by: Option<Uuid>,
    ) -> Result<SpendingCap, ServiceError> {
        let amount = amount.round_dp(2);
        if amount <= Decimal::ZERO {
            return Err(ServiceError::Validation(
                "cap amount must be at least 0.01".into(),
            ));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_cap"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        lock_caps(&mut *tx).await?;

        let now = Utc::now();
        let replaced = deactivate_caps(&mut *tx, now).await?;

        let sql = format!(
            r#"
            INSERT INTO spending_caps (cap_id, amount_usd, is_active, created_by, created_utc, updated_utc)
            VALUES ($1, $2, TRUE, $3, $4, $4)
            RETURNING {CAP_COLUMNS}
            "#
        );
        let cap = sqlx::query_as::<_, SpendingCap>(&sql)
            .bind(Uuid::new_v4())
            .bind(amount)
            .bind(created_by)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("Failed to insert spending cap"))?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit spending cap"))?;

        timer.observe_duration();

        info!(
            cap_id = %cap.cap_id,
            amount_usd = %cap.amount_usd,
            replaced = replaced,
            "Spending cap set"
        );

        Ok(cap)
    }

    /// Deactivate every cap. Returns how many were active.
    #[instrument(skip(self))]
    pub async fn clear_cap(&self) -> Result<u64, ServiceError> {
        let mut tx = self.db.begin().await?;
        lock_caps(&mut *tx).await?;
        let cleared = deactivate_caps(&mut *tx, Utc::now()).await?;
        tx.commit()
            .await
            .map_err(db_err("Failed to commit cap removal"))?;

        info!(cleared = cleared, "Spending cap cleared");
        Ok(cleared)
    }

    /// Budget read model. Without a cap this has the `has_cap = false` shape.
    #[instrument(skip(self))]
    pub async fn cap_status(&self) -> Result<CapStatus, ServiceError> {
        let mut conn = self.acquire().await?;
        let cap = active_cap_in(&mut *conn).await?;
        let month = current_month_in(&mut *conn, Utc::now()).await?;
        Ok(CapStatus::compute(&month, cap.as_ref()))
    }

    /// Active cap and this month's totals, read without writing anything.
    /// A month with no row yet reads as zero spend.
    #[instrument(skip(self))]
    pub async fn budget_snapshot(
        &self,
    ) -> Result<(Option<SpendingCap>, MonthlySpending), ServiceError> {
        let mut conn = self.acquire().await?;
        let cap = active_cap_in(&mut *conn).await?;
        let month = peek_month_in(&mut *conn, Utc::now()).await?;
        Ok((cap, month))
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, ServiceError> {
        self.db
            .pool()
            .acquire()
            .await
            .map_err(db_err("Failed to acquire connection"))
    }
}

pub fn year_month(at: DateTime<Utc>) -> (i32, i32) {
    (at.year(), at.month() as i32)
}

pub(crate) async fn current_month_in(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<MonthlySpending, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["current_month"])
        .start_timer();

    let (year, month) = year_month(now);

    sqlx::query(
        r#"
        INSERT INTO monthly_spending (year, month, created_utc, updated_utc)
        VALUES ($1, $2, $3, $3)
        ON CONFLICT (year, month) DO NOTHING
        "#,
    )
    .bind(year)
    .bind(month)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to create monthly spending"))?;

    let sql = format!("SELECT {MONTH_COLUMNS} FROM monthly_spending WHERE year = $1 AND month = $2");
    let spending = sqlx::query_as::<_, MonthlySpending>(&sql)
        .bind(year)
        .bind(month)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch monthly spending"))?;

    timer.observe_duration();
    Ok(spending)
}

pub(crate) async fn peek_month_in(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<MonthlySpending, ServiceError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["peek_month"])
        .start_timer();

    let (year, month) = year_month(now);
    let sql = format!("SELECT {MONTH_COLUMNS} FROM monthly_spending WHERE year = $1 AND month = $2");
    let spending = sqlx::query_as::<_, MonthlySpending>(&sql)
        .bind(year)
        .bind(month)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch monthly spending"))?;

    timer.observe_duration();
    Ok(spending.unwrap_or_else(|| MonthlySpending::empty(year, month, now)))
}

pub(crate) async fn active_cap_in(
    conn: &mut PgConnection,
) -> Result<Option<SpendingCap>, ServiceError> {
    let sql = format!(
        r#"
        SELECT {CAP_COLUMNS}
        FROM spending_caps
        WHERE is_active
        ORDER BY created_utc DESC
        LIMIT 1
        "#
    );
    sqlx::query_as::<_, SpendingCap>(&sql)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch spending cap"))
}

async fn lock_caps(conn: &mut PgConnection) -> Result<(), ServiceError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('spending_caps'))")
        .execute(&mut *conn)
        .await
        .map_err(db_err("Failed to lock spending caps"))?;
    Ok(())
}

async fn deactivate_caps(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64, ServiceError> {
    let result = sqlx::query(
        "UPDATE spending_caps SET is_active = FALSE, updated_utc = $1 WHERE is_active",
    )
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_err("Failed to deactivate spending caps"))?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_year_month_uses_utc_calendar() {
        let at = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(year_month(at), (2025, 12));
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(year_month(at), (2026, 1));
    }
}
