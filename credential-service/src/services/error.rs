use crate::models::{Provider, Tier};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("No credential available for {provider}/{tier}")]
    NoCredentialAvailable { provider: Provider, tier: Tier },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ServiceError {
    /// Classify a sqlx error, keeping `context` for the log line.
    pub fn from_sqlx(context: &'static str, source: sqlx::Error) -> Self {
        if is_storage_unavailable(&source) {
            ServiceError::StorageUnavailable(format!("{}: {}", context, source))
        } else {
            ServiceError::Database { context, source }
        }
    }

    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, ServiceError::StorageUnavailable(_))
    }
}

/// `map_err` adapter: `.map_err(db_err("Failed to fetch credential"))`.
pub fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> ServiceError {
    move |e| ServiceError::from_sqlx(context, e)
}

/// Missing tables (migrations not applied yet) and an unreachable pool mean
/// the store is not ready, as opposed to a failed query.
pub fn is_storage_unavailable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database { context, source } => {
                AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, source))
            }
            ServiceError::StorageUnavailable(msg) => {
                tracing::warn!(error = %msg, "Storage unavailable");
                AppError::ServiceUnavailable
            }
            ServiceError::DecryptionFailed => AppError::DecryptionFailed,
            ServiceError::EncryptionFailed => {
                AppError::InternalError(anyhow::anyhow!("Encryption failed"))
            }
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::InvalidTransition(msg) => {
                AppError::FailedPrecondition(anyhow::anyhow!(msg))
            }
            e @ ServiceError::NoCredentialAvailable { .. } => {
                AppError::FailedPrecondition(anyhow::anyhow!(e.to_string()))
            }
            ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
        }
    }
}
