//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Inside a batch
//! job the scheduler provides most of these (`SLURM_JOB_ID`, `USER`,
//! `CC_CLUSTER`); the rest have defaults.

pub mod cluster;

use crate::error::{Error, Result};
use crate::lock::LockOptions;
use cluster::Cluster;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    /// Identity whose queued jobs count against the ceiling.
    pub user: String,
    pub cluster: Cluster,
    /// Overrides the cluster ceiling when set.
    pub ceiling_override: Option<usize>,
    /// Id of the batch job we are running inside, if any.
    pub job_id: Option<String>,
    pub submit_command: PathBuf,
    pub queue_command: PathBuf,
    pub balance_command: Option<PathBuf>,
    /// Pause after each accepted submission.
    pub submit_delay: Duration,
    pub lock_stale_after: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup. `from_env` uses the process
    /// environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let user = var("USER").ok_or_else(|| {
            Error::Config("required environment variable USER is not set".to_string())
        })?;

        Ok(Self {
            user,
            cluster: Cluster::from_name(var("CC_CLUSTER").as_deref()),
            ceiling_override: parse_var(&var, "CASCADE_CEILING")?,
            job_id: var("SLURM_JOB_ID"),
            submit_command: var("CASCADE_SUBMIT_CMD")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sbatch")),
            queue_command: var("CASCADE_QUEUE_CMD")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("squeue")),
            balance_command: var("CASCADE_BALANCE_CMD").map(PathBuf::from),
            submit_delay: Duration::from_millis(
                parse_var(&var, "CASCADE_SUBMIT_DELAY_MS")?.unwrap_or(0),
            ),
            lock_stale_after: Duration::from_secs(
                parse_var(&var, "CASCADE_LOCK_STALE_SECS")?
                    .unwrap_or(LockOptions::default().stale_after.as_secs()),
            ),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Ceiling in effect for this run.
    pub fn ceiling(&self) -> usize {
        self.ceiling_override.unwrap_or_else(|| self.cluster.ceiling())
    }

    /// Identity written into the scheduler lock.
    ///
    /// Outside a batch job (the driver on a login node) there is no job id,
    /// so a unique local one is made up.
    pub fn owner_id(&self) -> String {
        match &self.job_id {
            Some(id) => id.clone(),
            None => {
                let id = format!("local-{}", uuid::Uuid::new_v4().simple());
                warn!(owner = %id, "SLURM_JOB_ID not set, using a generated owner id");
                id
            }
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_after: self.lock_stale_after,
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not valid: {e}"))),
    }
}
