//! Rotation engine: cap-exceeded failover plus manual and scheduled
//! single-tier rotations.
//!
//! Every rotation for a provider runs under a transaction-scoped advisory
//! lock keyed on the provider, so the cap check and the rotation it
//! triggers happen at most once across concurrent cost events. Within a
//! rotation each tier's work runs in a savepoint: a failing tier is rolled
//! back and audited as `failed` while the rest of the transaction proceeds.

use crate::models::{
    Credential, MonthlySpending, NewRotationLog, Provider, RotationLog, RotationSchedule,
    RotationStatus, RotationType, SpendingCap, Tier,
};
use crate::services::audit_log::append_in;
use crate::services::credential_pool::{activate_in, get_active_in, next_for_rotation_in};
use crate::services::database::Database;
use crate::services::error::{db_err, ServiceError};
use crate::services::metrics::ROTATIONS_TOTAL;
use crate::services::rotation_schedule::{fetch_in, mark_rotated_in};
use crate::services::spending_ledger::{active_cap_in, current_month_in, LedgerObserver};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Connection, PgConnection};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_COOLDOWN_SECONDS: i64 = 3600;

pub const NO_CANDIDATE_MESSAGE: &str = "no inactive or pending credential available";

#[derive(Debug, Clone)]
pub struct RotationSettings {
    /// Providers evaluated whenever the ledger changes.
    pub providers: Vec<Provider>,
    /// Minimum age of the active fallback credential before another
    /// cap-exceeded rotation may run.
    pub cooldown: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            providers: vec![Provider::OpenAi, Provider::Anthropic],
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECONDS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationDecision {
    pub rotate: bool,
    pub reason: String,
}

impl RotationDecision {
    fn no(reason: &str) -> Self {
        Self {
            rotate: false,
            reason: reason.to_string(),
        }
    }
}

/// Decide whether a cap-exceeded rotation is warranted.
pub fn evaluate(
    cap: Option<&SpendingCap>,
    month: &MonthlySpending,
    active_fallback: Option<&Credential>,
    has_fallback_candidate: bool,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> RotationDecision {
    let Some(cap) = cap else {
        return RotationDecision::no("no cap configured");
    };

    if !month.is_over_cap(Some(cap)) {
        return RotationDecision::no("within cap");
    }

    match active_fallback {
        Some(active) if active.activated_within(now, cooldown) => {
            return RotationDecision::no("recently rotated");
        }
        None if !has_fallback_candidate => {
            return RotationDecision::no("no fallback keys available");
        }
        _ => {}
    }

    let pct = month.percentage_of_cap(Some(cap)).unwrap_or_default();
    RotationDecision {
        rotate: true,
        reason: format!(
            "${:.2} exceeds ${:.2} ({:.1}%)",
            month.total_cost, cap.amount_usd, pct
        ),
    }
}

#[derive(Debug, Clone)]
pub struct TierFailure {
    pub tier: Tier,
    pub message: String,
}

/// Aggregate outcome of a cap-exceeded rotation.
#[derive(Debug, Clone)]
pub struct RotationResult {
    /// At least one tier rotated.
    pub success: bool,
    pub rotations_performed: Vec<RotationLog>,
    pub errors: Vec<TierFailure>,
    pub reason: String,
}

enum TierRotation {
    Rotated(RotationLog),
    Unavailable,
}

#[derive(Clone)]
pub struct RotationEngine {
    db: Database,
    settings: RotationSettings,
}

impl RotationEngine {
    pub fn new(db: Database, settings: RotationSettings) -> Self {
        Self { db, settings }
    }

    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn should_rotate(&self, provider: Provider) -> Result<RotationDecision, ServiceError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(db_err("Failed to acquire connection"))?;
        self.should_rotate_in(&mut *conn, provider).await
    }

    async fn should_rotate_in(
        &self,
        conn: &mut PgConnection,
        provider: Provider,
    ) -> Result<RotationDecision, ServiceError> {
        let now = Utc::now();
        let cap = active_cap_in(conn).await?;
        if cap.is_none() {
            return Ok(RotationDecision::no("no cap configured"));
        }

        let month = current_month_in(conn, now).await?;
        let active_fallback = get_active_in(conn, provider, Tier::Fallback).await?;
        let has_candidate = next_for_rotation_in(conn, provider, Tier::Fallback)
            .await?
            .is_some();

        Ok(evaluate(
            cap.as_ref(),
            &month,
            active_fallback.as_ref(),
            has_candidate,
            now,
            self.settings.cooldown,
        ))
    }

    // -------------------------------------------------------------------------
    // Cap-exceeded rotation
    // -------------------------------------------------------------------------

    /// Rotate every tier of `provider` to its next credential. The decision
    /// is re-checked under the provider lock; if it no longer holds nothing
    /// is rotated and `reason` says why.
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn rotate_to_fallback(&self, provider: Provider) -> Result<RotationResult, ServiceError> {
        let mut tx = self.db.begin().await?;
        lock_provider(&mut *tx, provider).await?;

        let decision = self.should_rotate_in(&mut *tx, provider).await?;
        if !decision.rotate {
            tx.commit()
                .await
                .map_err(db_err("Failed to commit rotation check"))?;
            return Ok(RotationResult {
                success: false,
                rotations_performed: Vec::new(),
                errors: Vec::new(),
                reason: decision.reason,
            });
        }

        let mut rotations_performed = Vec::new();
        let mut errors = Vec::new();

        for tier in Tier::ALL {
            let old = get_active_in(&mut *tx, provider, tier).await?;
            let outcome = rotate_tier_guarded(
                &mut *tx,
                provider,
                tier,
                old.as_ref(),
                RotationType::CapExceeded,
                None,
                Some(decision.reason.clone()),
            )
            .await?;

            match outcome {
                Ok(TierRotation::Rotated(log)) => {
                    record_metric(provider, tier, RotationType::CapExceeded, RotationStatus::Success);
                    rotations_performed.push(log);
                }
                Ok(TierRotation::Unavailable) => {
                    warn!(tier = %tier, "No credential available for cap-exceeded rotation");
                    let entry = NewRotationLog::failed(
                        provider,
                        tier,
                        RotationType::CapExceeded,
                        old.as_ref(),
                        NO_CANDIDATE_MESSAGE,
                    );
                    append_failure(&mut *tx, tier, &entry).await;
                    errors.push(TierFailure {
                        tier,
                        message: NO_CANDIDATE_MESSAGE.to_string(),
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    let entry = NewRotationLog::failed(
                        provider,
                        tier,
                        RotationType::CapExceeded,
                        old.as_ref(),
                        message.clone(),
                    );
                    append_failure(&mut *tx, tier, &entry).await;
                    errors.push(TierFailure { tier, message });
                }
            }
        }

        tx.commit()
            .await
            .map_err(db_err("Failed to commit rotation"))?;

        let result = RotationResult {
            success: !rotations_performed.is_empty(),
            rotations_performed,
            errors,
            reason: decision.reason,
        };

        info!(
            rotated = result.rotations_performed.len(),
            failed = result.errors.len(),
            reason = %result.reason,
            "Cap-exceeded rotation finished"
        );

        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Single-tier rotations
    // -------------------------------------------------------------------------

    /// Administrative rotation of one tier. Nothing to rotate to is audited
    /// as a failure and reported to the caller.
    #[instrument(skip(self, notes), fields(provider = %provider, tier = %tier))]
    pub async fn rotate_manual(
        &self,
        provider: Provider,
        tier: Tier,
        rotated_by: Option<Uuid>,
        notes: Option<String>,
    ) -> Result<RotationLog, ServiceError> {
        let mut tx = self.db.begin().await?;
        lock_provider(&mut *tx, provider).await?;

        let old = get_active_in(&mut *tx, provider, tier).await?;
        let outcome = rotate_tier_guarded(
            &mut *tx,
            provider,
            tier,
            old.as_ref(),
            RotationType::Manual,
            rotated_by,
            notes.clone(),
        )
        .await?;

        let failure = match outcome {
            Ok(TierRotation::Rotated(log)) => {
                tx.commit()
                    .await
                    .map_err(db_err("Failed to commit rotation"))?;
                record_metric(provider, tier, RotationType::Manual, RotationStatus::Success);
                info!(log_id = %log.log_id, "Manual rotation completed");
                return Ok(log);
            }
            Ok(TierRotation::Unavailable) => ServiceError::NoCredentialAvailable { provider, tier },
            Err(e) => e,
        };

        let message = match &failure {
            ServiceError::NoCredentialAvailable { .. } => NO_CANDIDATE_MESSAGE.to_string(),
            e => e.to_string(),
        };
        let entry = NewRotationLog::failed(provider, tier, RotationType::Manual, old.as_ref(), message)
            .rotated_by(rotated_by)
            .notes(notes);
        append_in(&mut *tx, &entry).await?;
        tx.commit()
            .await
            .map_err(db_err("Failed to commit rotation log"))?;
        record_metric(provider, tier, RotationType::Manual, RotationStatus::Failed);
        Err(failure)
    }

    /// Scheduled rotation of one tier. Returns `None` if another worker
    /// already handled the schedule. With nothing to rotate to, a `skipped`
    /// entry is written; a rotation error is audited as `failed` and
    /// returned. Either way the schedule advances to its next period.
    #[instrument(skip(self, schedule), fields(provider = %schedule.provider, tier = %schedule.tier))]
    pub async fn rotate_scheduled(
        &self,
        schedule: &RotationSchedule,
    ) -> Result<Option<RotationLog>, ServiceError> {
        let provider = schedule.provider;
        let tier = schedule.tier;
        let now = Utc::now();

        let mut tx = self.db.begin().await?;
        lock_provider(&mut *tx, provider).await?;

        let still_due = fetch_in(&mut *tx, provider, tier, true)
            .await?
            .is_some_and(|current| current.is_due(now));
        if !still_due {
            debug!("Schedule no longer due");
            return Ok(None);
        }

        let old = get_active_in(&mut *tx, provider, tier).await?;
        let outcome = rotate_tier_guarded(
            &mut *tx,
            provider,
            tier,
            old.as_ref(),
            RotationType::Scheduled,
            None,
            None,
        )
        .await?;

        let (log, status, failure) = match outcome {
            Ok(TierRotation::Rotated(log)) => (log, RotationStatus::Success, None),
            Ok(TierRotation::Unavailable) => {
                let entry = NewRotationLog::new(
                    provider,
                    tier,
                    RotationType::Scheduled,
                    RotationStatus::Skipped,
                )
                .with_old(old.as_ref())
                .notes(Some(NO_CANDIDATE_MESSAGE.to_string()));
                let log = append_in(&mut *tx, &entry).await?;
                mark_rotated_in(&mut *tx, provider, tier, now).await?;
                (log, RotationStatus::Skipped, None)
            }
            Err(e) => {
                let entry = NewRotationLog::failed(
                    provider,
                    tier,
                    RotationType::Scheduled,
                    old.as_ref(),
                    e.to_string(),
                );
                let log = append_in(&mut *tx, &entry).await?;
                mark_rotated_in(&mut *tx, provider, tier, now).await?;
                (log, RotationStatus::Failed, Some(e))
            }
        };

        tx.commit()
            .await
            .map_err(db_err("Failed to commit scheduled rotation"))?;

        record_metric(provider, tier, RotationType::Scheduled, status);
        info!(log_id = %log.log_id, status = status.as_str(), "Scheduled rotation finished");

        match failure {
            Some(e) => Err(e),
            None => Ok(Some(log)),
        }
    }
}

#[async_trait]
impl LedgerObserver for RotationEngine {
    async fn on_ledger_changed(&self) {
        for &provider in &self.settings.providers {
            let decision = match self.should_rotate(provider).await {
                Ok(decision) => decision,
                Err(e) if e.is_storage_unavailable() => {
                    debug!(provider = %provider, error = %e, "Rotation check skipped, storage not ready");
                    continue;
                }
                Err(e) => {
                    error!(provider = %provider, error = %e, "Rotation check failed");
                    continue;
                }
            };

            if !decision.rotate {
                debug!(provider = %provider, reason = %decision.reason, "No rotation needed");
                continue;
            }

            info!(provider = %provider, reason = %decision.reason, "Spending cap exceeded, rotating credentials");

            match self.rotate_to_fallback(provider).await {
                Ok(result) if !result.success && result.errors.is_empty() => {
                    debug!(provider = %provider, reason = %result.reason, "Rotation no longer needed");
                }
                Ok(result) if !result.success => {
                    warn!(provider = %provider, failed = result.errors.len(), "No tier could be rotated");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(provider = %provider, error = %e, "Cap-exceeded rotation failed");
                }
            }
        }
    }
}

/// Run [`rotate_tier_in`] inside a savepoint of `conn`'s transaction. The
/// outer `Result` fails only when the savepoint itself cannot be managed;
/// a tier error rolls the savepoint back and comes back in the inner one,
/// leaving the transaction usable for the failure entry.
async fn rotate_tier_guarded(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
    old: Option<&Credential>,
    rotation_type: RotationType,
    rotated_by: Option<Uuid>,
    notes: Option<String>,
) -> Result<Result<TierRotation, ServiceError>, ServiceError> {
    let mut savepoint = conn
        .begin()
        .await
        .map_err(db_err("Failed to open savepoint"))?;

    let outcome = rotate_tier_in(
        &mut *savepoint,
        provider,
        tier,
        old,
        rotation_type,
        rotated_by,
        notes,
    )
    .await;

    match outcome {
        Ok(rotation) => {
            savepoint
                .commit()
                .await
                .map_err(db_err("Failed to release savepoint"))?;
            Ok(Ok(rotation))
        }
        Err(e) => {
            savepoint
                .rollback()
                .await
                .map_err(db_err("Failed to roll back savepoint"))?;
            warn!(tier = %tier, error = %e, "Tier rotation failed");
            Ok(Err(e))
        }
    }
}

/// Rotate one tier on `conn`: activate the next credential, audit success
/// and advance the pair's schedule. With no candidate nothing is written and
/// the caller decides how to audit it.
async fn rotate_tier_in(
    conn: &mut PgConnection,
    provider: Provider,
    tier: Tier,
    old: Option<&Credential>,
    rotation_type: RotationType,
    rotated_by: Option<Uuid>,
    notes: Option<String>,
) -> Result<TierRotation, ServiceError> {
    let Some(candidate) = next_for_rotation_in(conn, provider, tier).await? else {
        return Ok(TierRotation::Unavailable);
    };

    let activation = activate_in(conn, candidate.credential_id).await?;

    let entry = NewRotationLog::success(rotation_type, old, &activation.credential)
        .rotated_by(rotated_by)
        .notes(notes);
    let log = append_in(conn, &entry).await?;

    mark_rotated_in(conn, provider, tier, log.rotated_utc).await?;

    info!(
        tier = %tier,
        old = ?old.map(Credential::masked),
        new = %activation.credential.masked(),
        rotation_type = rotation_type.as_str(),
        "Credential rotated"
    );

    Ok(TierRotation::Rotated(log))
}

/// Best-effort failure entry; an audit write error is logged, not returned.
async fn append_failure(conn: &mut PgConnection, tier: Tier, entry: &NewRotationLog) {
    record_metric(entry.provider, tier, entry.rotation_type, RotationStatus::Failed);
    if let Err(e) = append_in(conn, entry).await {
        error!(tier = %tier, error = %e, "Failed to audit tier rotation failure");
    }
}

async fn lock_provider(conn: &mut PgConnection, provider: Provider) -> Result<(), ServiceError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('credential-rotation:' || $1))")
        .bind(provider.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_err("Failed to acquire rotation lock"))?;
    Ok(())
}

fn record_metric(provider: Provider, tier: Tier, rotation_type: RotationType, status: RotationStatus) {
    ROTATIONS_TOTAL
        .with_label_values(&[
            provider.as_str(),
            tier.as_str(),
            rotation_type.as_str(),
            status.as_str(),
        ])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{cap, month};
    use crate::models::CredentialStatus;
    use rust_decimal_macros::dec;

    fn fallback_activated(seconds_ago: i64, now: DateTime<Utc>) -> Credential {
        Credential {
            credential_id: Uuid::new_v4(),
            provider: Provider::OpenAi,
            tier: Tier::Fallback,
            label: "fallback".to_string(),
            secret: Vec::new(),
            secret_prefix: "sk-fallb".to_string(),
            status: CredentialStatus::Active,
            usage_count: 0,
            last_used_utc: None,
            activated_utc: Some(now - Duration::seconds(seconds_ago)),
            deactivated_utc: None,
            added_utc: now - Duration::days(10),
            added_by: None,
            notes: None,
        }
    }

    fn cooldown() -> Duration {
        Duration::seconds(DEFAULT_COOLDOWN_SECONDS)
    }

    #[test]
    fn test_no_cap_configured() {
        let d = evaluate(None, &month(dec!(100)), None, true, Utc::now(), cooldown());
        assert_eq!(d, RotationDecision::no("no cap configured"));
    }

    #[test]
    fn test_within_cap() {
        let c = cap(dec!(50));
        let d = evaluate(Some(&c), &month(dec!(50)), None, true, Utc::now(), cooldown());
        assert!(!d.rotate);
        assert_eq!(d.reason, "within cap");
    }

    #[test]
    fn test_recently_rotated() {
        let now = Utc::now();
        let c = cap(dec!(50));
        let active = fallback_activated(60, now);
        let d = evaluate(Some(&c), &month(dec!(60)), Some(&active), true, now, cooldown());
        assert_eq!(d, RotationDecision::no("recently rotated"));
    }

    #[test]
    fn test_cooldown_expired_rotates_again() {
        let now = Utc::now();
        let c = cap(dec!(50));
        let active = fallback_activated(DEFAULT_COOLDOWN_SECONDS + 1, now);
        let d = evaluate(Some(&c), &month(dec!(60)), Some(&active), false, now, cooldown());
        assert!(d.rotate);
    }

    #[test]
    fn test_no_fallback_keys() {
        let c = cap(dec!(50));
        let d = evaluate(Some(&c), &month(dec!(60)), None, false, Utc::now(), cooldown());
        assert_eq!(d, RotationDecision::no("no fallback keys available"));
    }

    #[test]
    fn test_rotate_reason() {
        let c = cap(dec!(50));
        let d = evaluate(Some(&c), &month(dec!(60)), None, true, Utc::now(), cooldown());
        assert!(d.rotate);
        assert_eq!(d.reason, "$60.00 exceeds $50.00 (120.0%)");
    }
}
