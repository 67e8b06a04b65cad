//! HTTP middleware shared by the health/metrics side-ports.

pub mod metrics;
pub mod tracing;
