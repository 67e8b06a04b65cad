//! gRPC utilities shared by micros services.

pub mod error;

pub use error::{GrpcResult, IntoStatus};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
