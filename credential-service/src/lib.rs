//! Credential Service - provider credential pool with budget-driven rotation.

pub mod config;
pub mod grpc;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
