//! Periodic worker that performs due scheduled rotations.

use crate::models::RotationSchedule;
use crate::services::{RotationEngine, ScheduleStore, ServiceError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct RotationScheduler {
    schedules: ScheduleStore,
    engine: Arc<RotationEngine>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl RotationScheduler {
    pub fn new(schedules: ScheduleStore, engine: Arc<RotationEngine>, interval: Duration) -> Self {
        Self {
            schedules,
            engine,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(self) {
        tracing::info!(
            interval_seconds = self.interval.as_secs(),
            "Starting rotation scheduler"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Rotation scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(rotated) => tracing::info!(rotated, "Scheduled rotations processed"),
                        Err(e) if e.is_storage_unavailable() => {
                            tracing::debug!(error = %e, "Schedule scan skipped, storage not ready");
                        }
                        Err(e) => tracing::error!(error = %e, "Schedule scan failed"),
                    }
                }
            }
        }
    }

    /// Rotate every due schedule once. Failures are logged per schedule so
    /// one bad pair does not block the rest. Returns how many were handled.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let due = self.schedules.list_due(Utc::now()).await?;
        let mut handled = 0;

        for schedule in &due {
            if self.rotate(schedule).await {
                handled += 1;
            }
        }

        Ok(handled)
    }

    async fn rotate(&self, schedule: &RotationSchedule) -> bool {
        match self.engine.rotate_scheduled(schedule).await {
            Ok(Some(log)) => {
                tracing::info!(
                    provider = %schedule.provider,
                    tier = %schedule.tier,
                    status = log.status.as_str(),
                    "Scheduled rotation completed"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(
                    provider = %schedule.provider,
                    tier = %schedule.tier,
                    error = %e,
                    "Scheduled rotation failed"
                );
                false
            }
        }
    }
}
