//! Background workers.

mod scheduler;

pub use scheduler::RotationScheduler;
