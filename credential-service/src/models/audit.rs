//! Rotation audit log model. Entries are write-once.

use super::{Credential, Provider, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RotationStatus {
    Success,
    Failed,
    Skipped,
}

impl RotationStatus {
    pub fn to_proto(self) -> i32 {
        match self {
            Self::Success => 1,
            Self::Failed => 2,
            Self::Skipped => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// What caused a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RotationType {
    Scheduled,
    Manual,
    CapExceeded,
}

impl RotationType {
    pub fn to_proto(self) -> i32 {
        match self {
            Self::Scheduled => 1,
            Self::Manual => 2,
            Self::CapExceeded => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::CapExceeded => "cap_exceeded",
        }
    }
}

/// Persisted audit entry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RotationLog {
    pub log_id: Uuid,
    pub provider: Provider,
    pub tier: Option<Tier>,
    pub old_credential_id: Option<Uuid>,
    pub new_credential_id: Option<Uuid>,
    pub old_masked: Option<String>,
    pub new_masked: Option<String>,
    pub status: RotationStatus,
    pub rotation_type: RotationType,
    /// `None` means the rotation was automatic.
    pub rotated_by: Option<Uuid>,
    pub error_message: Option<String>,
    pub notes: Option<String>,
    pub rotated_utc: DateTime<Utc>,
}

/// Audit entry about to be appended.
///
/// Masked values are captured from the credentials at construction time so
/// the entry stays readable after the referenced records are purged.
#[derive(Debug, Clone)]
pub struct NewRotationLog {
    pub provider: Provider,
    pub tier: Option<Tier>,
    pub old_credential_id: Option<Uuid>,
    pub new_credential_id: Option<Uuid>,
    pub old_masked: Option<String>,
    pub new_masked: Option<String>,
    pub status: RotationStatus,
    pub rotation_type: RotationType,
    pub rotated_by: Option<Uuid>,
    pub error_message: Option<String>,
    pub notes: Option<String>,
}

impl NewRotationLog {
    pub fn new(
        provider: Provider,
        tier: Tier,
        rotation_type: RotationType,
        status: RotationStatus,
    ) -> Self {
        Self {
            provider,
            tier: Some(tier),
            old_credential_id: None,
            new_credential_id: None,
            old_masked: None,
            new_masked: None,
            status,
            rotation_type,
            rotated_by: None,
            error_message: None,
            notes: None,
        }
    }

    pub fn success(
        rotation_type: RotationType,
        old: Option<&Credential>,
        new: &Credential,
    ) -> Self {
        Self::new(new.provider, new.tier, rotation_type, RotationStatus::Success)
            .with_old(old)
            .with_new(Some(new))
    }

    pub fn failed(
        provider: Provider,
        tier: Tier,
        rotation_type: RotationType,
        old: Option<&Credential>,
        error: impl Into<String>,
    ) -> Self {
        let mut entry =
            Self::new(provider, tier, rotation_type, RotationStatus::Failed).with_old(old);
        entry.error_message = Some(error.into());
        entry
    }

    pub fn with_old(mut self, old: Option<&Credential>) -> Self {
        self.old_credential_id = old.map(|c| c.credential_id);
        self.old_masked = old.map(Credential::masked);
        self
    }

    pub fn with_new(mut self, new: Option<&Credential>) -> Self {
        self.new_credential_id = new.map(|c| c.credential_id);
        self.new_masked = new.map(Credential::masked);
        self
    }

    pub fn rotated_by(mut self, user: Option<Uuid>) -> Self {
        self.rotated_by = user;
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}
