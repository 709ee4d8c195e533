//! Account balancer collaborator.
//!
//! Spreading jobs across several scheduler accounts is somebody else's
//! program. Every cascaded job calls it once, after its scheduling turn.

use crate::error::{Error, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub trait AccountBalancer {
    fn balance(&self, identity: &str, results_dir: &Path) -> impl Future<Output = Result<()>>;
}

/// Runs `<program> <identity> <results_dir>` and waits for it.
#[derive(Debug, Clone)]
pub struct CommandBalancer {
    pub program: PathBuf,
}

impl CommandBalancer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AccountBalancer for CommandBalancer {
    async fn balance(&self, identity: &str, results_dir: &Path) -> Result<()> {
        debug!(program = %self.program.display(), identity, "running account balancer");
        let output = Command::new(&self.program)
            .arg(identity)
            .arg(results_dir)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Command {
                command: self.program.display().to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Used when no balancer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBalancer;

impl AccountBalancer for NoopBalancer {
    async fn balance(&self, identity: &str, _results_dir: &Path) -> Result<()> {
        debug!(identity, "no account balancer configured, skipping");
        Ok(())
    }
}

/// Either balancer, picked from configuration at startup.
#[derive(Debug, Clone)]
pub enum Balancer {
    Command(CommandBalancer),
    Noop(NoopBalancer),
}

impl Balancer {
    pub fn from_program(program: Option<PathBuf>) -> Self {
        match program {
            Some(program) => Balancer::Command(CommandBalancer::new(program)),
            None => Balancer::Noop(NoopBalancer),
        }
    }
}

impl AccountBalancer for Balancer {
    async fn balance(&self, identity: &str, results_dir: &Path) -> Result<()> {
        match self {
            Balancer::Command(b) => b.balance(identity, results_dir).await,
            Balancer::Noop(b) => b.balance(identity, results_dir).await,
        }
    }
}
