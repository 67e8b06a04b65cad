//! gRPC module for credential-service.

mod service;

pub use service::CredentialServiceImpl;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("micros.credential.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("credential_descriptor");
}
