//! Error conversion utilities between `AppError` and `tonic::Status`.
//!
//! | AppError | gRPC Status |
//! |----------|-------------|
//! | `ValidationError`, `BadRequest` | `INVALID_ARGUMENT` |
//! | `NotFound` | `NOT_FOUND` |
//! | `Conflict` | `ALREADY_EXISTS` |
//! | `FailedPrecondition` | `FAILED_PRECONDITION` |
//! | `ServiceUnavailable` | `UNAVAILABLE` |
//! | everything else | `INTERNAL` |

use tonic::{Code, Status};

use crate::error::AppError;

/// Extension trait for converting types into `tonic::Status`.
pub trait IntoStatus {
    /// Convert into a `tonic::Status`.
    fn into_status(self) -> Status;
}

impl IntoStatus for AppError {
    fn into_status(self) -> Status {
        match self {
            AppError::ValidationError(err) => {
                Status::invalid_argument(format!("Validation error: {}", err))
            }
            AppError::BadRequest(err) => Status::invalid_argument(err.to_string()),
            AppError::NotFound(err) => Status::not_found(err.to_string()),
            AppError::Conflict(err) => Status::already_exists(err.to_string()),
            AppError::FailedPrecondition(err) => Status::failed_precondition(err.to_string()),
            AppError::InternalError(err) => {
                // Log the full error but don't expose it to clients
                tracing::error!(error = %err, "Internal error");
                Status::internal("Internal server error")
            }
            AppError::ServiceUnavailable => Status::unavailable("Service unavailable"),
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                Status::internal("Database error")
            }
            AppError::DecryptionFailed => Status::internal("Decryption failed"),
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                Status::internal("Configuration error")
            }
        }
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.into_status()
    }
}

/// Convert a `tonic::Status` back to an `AppError`.
impl From<Status> for AppError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::InvalidArgument | Code::OutOfRange => {
                AppError::BadRequest(anyhow::anyhow!("{}", status.message()))
            }
            Code::NotFound => AppError::NotFound(anyhow::anyhow!("{}", status.message())),
            Code::AlreadyExists => AppError::Conflict(anyhow::anyhow!("{}", status.message())),
            Code::FailedPrecondition => {
                AppError::FailedPrecondition(anyhow::anyhow!("{}", status.message()))
            }
            Code::Unavailable => AppError::ServiceUnavailable,
            _ => AppError::InternalError(anyhow::anyhow!(
                "Request failed ({:?}): {}",
                status.code(),
                status.message()
            )),
        }
    }
}

/// Result type alias for gRPC handlers.
pub type GrpcResult<T> = Result<tonic::Response<T>, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_to_status() {
        let err = AppError::NotFound(anyhow::anyhow!("Credential not found"));
        let status: Status = err.into();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("Credential not found"));
    }

    #[test]
    fn test_failed_precondition_round_trip() {
        let status: Status =
            AppError::FailedPrecondition(anyhow::anyhow!("credential is revoked")).into();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let err: AppError = status.into();
        assert!(matches!(err, AppError::FailedPrecondition(_)));
    }

    #[test]
    fn test_database_error_is_not_leaked() {
        let err = AppError::DatabaseError(anyhow::anyhow!("password authentication failed"));
        let status: Status = err.into();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Database error");
    }

    #[test]
    fn test_decryption_failure_message_is_fixed() {
        let status: Status = AppError::DecryptionFailed.into();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Decryption failed");
    }
}
