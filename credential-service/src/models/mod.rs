//! Domain models for credential-service.

mod audit;
mod credential;
mod schedule;
mod spending;

pub use audit::{NewRotationLog, RotationLog, RotationStatus, RotationType};
pub use credential::{
    mask_prefix, secret_prefix, Credential, CredentialFilter, CredentialStatus, NewCredential,
    Provider, Tier, SECRET_PREFIX_LEN,
};
pub use schedule::{compute_next_rotation, RotationFrequency, RotationSchedule, UpdateSchedule};
pub use spending::{
    AlertLevel, CapStatus, MonthlySpending, SpendCategory, SpendDelta, SpendingCap,
};

#[cfg(test)]
pub(crate) use spending::fixtures;
