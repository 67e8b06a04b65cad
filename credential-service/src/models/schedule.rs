//! Rotation schedule model.

use super::{Provider, Tier};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How often a scheduled rotation should happen.
///
/// Deltas are fixed day counts (a "month" is 30 days, a "quarter" 90),
/// not calendar boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RotationFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl RotationFrequency {
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Daily),
            2 => Some(Self::Weekly),
            3 => Some(Self::Monthly),
            4 => Some(Self::Quarterly),
            _ => None,
        }
    }

    pub fn to_proto(self) -> i32 {
        match self {
            Self::Daily => 1,
            Self::Weekly => 2,
            Self::Monthly => 3,
            Self::Quarterly => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }

    pub fn delta(self) -> Duration {
        match self {
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::days(7),
            Self::Monthly => Duration::days(30),
            Self::Quarterly => Duration::days(90),
        }
    }
}

impl Default for RotationFrequency {
    fn default() -> Self {
        Self::Weekly
    }
}

/// Per (provider, tier) rotation schedule.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub schedule_id: Uuid,
    pub provider: Provider,
    pub tier: Tier,
    pub enabled: bool,
    pub frequency: RotationFrequency,
    pub last_rotation_utc: Option<DateTime<Utc>>,
    pub next_rotation_utc: Option<DateTime<Utc>>,
    pub notify_before_days: i32,
    pub notify_emails: Vec<String>,
    pub owner_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl RotationSchedule {
    /// `last_rotation_utc` (or `now` if never rotated) plus the frequency delta.
    pub fn compute_next_rotation(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        compute_next_rotation(self.frequency, self.last_rotation_utc, now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.next_rotation_utc {
            None => true,
            Some(next) => now >= next,
        }
    }
}

pub fn compute_next_rotation(
    frequency: RotationFrequency,
    last_rotation: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    last_rotation.unwrap_or(now) + frequency.delta()
}

/// Input for updating a schedule's settings.
#[derive(Debug, Clone)]
pub struct UpdateSchedule {
    pub enabled: bool,
    pub frequency: RotationFrequency,
    pub notify_before_days: i32,
    pub notify_emails: Vec<String>,
    pub owner_id: Option<Uuid>,
}
