//! Scheduling engine: admission turns, submission, and the cascade entry.

pub mod admission;
pub mod cascade;
pub mod executor;

pub use admission::{AdmissionConfig, AdmissionController, INITIAL_BATCH};
pub use cascade::{JobEntry, SchedulingPhase};
pub use executor::{ExecutorConfig, SubmissionExecutor};
