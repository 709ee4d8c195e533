//! Batch service adapter.
//!
//! [`BatchService`] is the seam between admission control and the cluster
//! scheduler. [`Slurm`] shells out to `squeue` and `sbatch`; tests provide
//! their own implementations.

use crate::error::{Error, Result};
use crate::model::JobId;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// The external batch service, as seen by one submitting identity.
pub trait BatchService {
    /// Jobs this identity currently has queued or running.
    fn active_count(&self) -> impl Future<Output = Result<usize>>;

    /// Submit one descriptor script, invoked from `workdir`.
    fn submit(&self, descriptor: &Path, workdir: &Path) -> impl Future<Output = Result<JobId>>;
}

/// Slurm via its command-line tools.
#[derive(Debug, Clone)]
pub struct Slurm {
    /// Identity whose jobs count against the ceiling.
    pub user: String,
    pub submit_command: PathBuf,
    pub queue_command: PathBuf,
}

impl Slurm {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            submit_command: PathBuf::from("sbatch"),
            queue_command: PathBuf::from("squeue"),
        }
    }

    pub fn submit_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.submit_command = command.into();
        self
    }

    pub fn queue_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.queue_command = command.into();
        self
    }
}

impl BatchService for Slurm {
    async fn active_count(&self) -> Result<usize> {
        let output = Command::new(&self.queue_command)
            .args(["-h", "-u", &self.user, "-o", "%i"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(command_error(&self.queue_command, &output));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| Error::QueueParse(format!("non-utf8 output: {e}")))?;
        let count = count_queue_lines(&stdout);
        debug!(user = %self.user, count, "queried batch queue");
        Ok(count)
    }

    async fn submit(&self, descriptor: &Path, workdir: &Path) -> Result<JobId> {
        let output = Command::new(&self.submit_command)
            .arg(descriptor)
            .current_dir(workdir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(command_error(&self.submit_command, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        JobId::from_submit_output(&stdout).ok_or_else(|| Error::JobIdParse(stdout.into_owned()))
    }
}

/// One non-blank line per job. Any header line is suppressed by `-h`.
fn count_queue_lines(stdout: &str) -> usize {
    stdout.lines().filter(|line| !line.trim().is_empty()).count()
}

fn command_error(command: &Path, output: &std::process::Output) -> Error {
    Error::Command {
        command: command.display().to_string(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}
