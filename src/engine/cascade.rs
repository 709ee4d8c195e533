//! Cascade entry point for submitted jobs.
//!
//! Every job this crate submits starts here. Before its own work it spends
//! a moment as the scheduler: one admission turn, then one call to the
//! account balancer. The running jobs between them keep the queue draining
//! without any long-lived coordinator.
//!
//! If the last running job finishes while entries are still queued, nothing
//! notices. The queue stalls until someone runs `cascade turn` by hand.

use crate::balance::AccountBalancer;
use crate::error::{Error, Result};
use crate::model::TurnOutcome;
use crate::slurm::BatchService;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::admission::AdmissionController;

/// What the scheduling phase did.
#[derive(Debug)]
pub struct SchedulingPhase {
    pub turn: Result<TurnOutcome>,
    pub balance: Result<()>,
}

impl SchedulingPhase {
    /// True when the turn hit the fatal no-submissions condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self.turn, Err(Error::ServiceUnavailable { .. }))
    }
}

/// A job's two-phase entry: scheduling work first, payload second.
pub struct JobEntry<'a, S, B> {
    controller: &'a AdmissionController<S>,
    balancer: &'a B,
    /// This job's id. Only ever written into the scheduler lock.
    pub owner: String,
    /// Scheduler account user the balancer works for.
    pub identity: String,
    pub results_dir: PathBuf,
}

impl<'a, S: BatchService, B: AccountBalancer> JobEntry<'a, S, B> {
    pub fn new(
        controller: &'a AdmissionController<S>,
        balancer: &'a B,
        owner: impl Into<String>,
        identity: impl Into<String>,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            controller,
            balancer,
            owner: owner.into(),
            identity: identity.into(),
            results_dir: results_dir.into(),
        }
    }

    /// Phase one: exactly one turn, then exactly one balance call.
    ///
    /// Neither failure stops the other; both are reported.
    pub async fn schedule(&self) -> SchedulingPhase {
        let turn = self.controller.run_turn(&self.owner).await;
        if let Err(e) = &turn {
            error!(owner = %self.owner, error = %e, "scheduling turn failed");
        }

        let balance = self
            .balancer
            .balance(&self.identity, &self.results_dir)
            .await;
        if let Err(e) = &balance {
            warn!(identity = %self.identity, error = %e, "account balancer failed");
        }

        SchedulingPhase { turn, balance }
    }

    /// Both phases. Returns the scheduling report and the payload's exit
    /// code.
    ///
    /// The payload runs even when scheduling failed: the compute slot is
    /// already ours.
    pub async fn run(&self, payload: &[String]) -> Result<(SchedulingPhase, i32)> {
        let phase = self.schedule().await;
        if phase.is_fatal() {
            // The payload's exit status is all the batch service records,
            // so this line in the job's output is the only trace.
            error!(
                owner = %self.owner,
                "batch service unavailable during scheduling, queue left as is; running payload anyway"
            );
        }
        let code = run_payload(payload).await?;
        Ok((phase, code))
    }
}

/// Phase two: run the job's real work with inherited stdio.
pub async fn run_payload(payload: &[String]) -> Result<i32> {
    let Some((program, args)) = payload.split_first() else {
        return Err(Error::Other("empty payload command".to_string()));
    };

    info!(program = %program, "starting payload");
    let status = Command::new(program).args(args).status().await?;
    let code = status.code().unwrap_or(1);
    if status.success() {
        info!(code, "payload finished");
    } else {
        warn!(code, "payload exited unsuccessfully");
    }
    Ok(code)
}
