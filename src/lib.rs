//! # cascade-rs
//!
//! Coordinator-free admission control for Slurm-style batch services.
//!
//! A fixed batch of job scripts waits in a queue directory. No daemon feeds
//! it to the cluster: each job, as it starts, takes one scheduling turn
//! (checks how much room its user has left under the cluster ceiling, takes
//! a filesystem lock, submits that many more) and then runs its own work.

pub mod balance;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod queue;
pub mod slurm;
pub mod telemetry;
