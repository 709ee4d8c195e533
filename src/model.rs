//! Core data model.
//!
//! A job descriptor is an executable script waiting in the queue directory.
//! Its identity is its file name; the batch service assigns it a job id once
//! accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Job id
// ---------------------------------------------------------------------------

/// Identifier assigned by the batch service to an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Parse a job id out of submit-command stdout.
    ///
    /// The id is the last whitespace-delimited field, so both
    /// `Submitted batch job 4242` and `--parsable` output work.
    pub fn from_submit_output(stdout: &str) -> Option<Self> {
        let last = stdout.split_whitespace().last()?;
        // `--parsable` appends `;cluster` on federated setups
        let id = last.split(';').next().unwrap_or(last);
        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of a job descriptor as far as this crate is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Linked into the queue directory.
    Pending,
    /// Accepted by the batch service, queue entry removed.
    Submitted,
    /// Finished or cancelled. The batch service's business from here.
    Terminal,
}

impl JobState {
    /// Can transition from self to `to`?
    ///
    /// There is no way back to `Pending`: a removed entry is never
    /// resubmitted.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!((self, to), (Pending, Submitted) | (Submitted, Terminal))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::Terminal => "terminal",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

/// A reference in the queue directory pointing at a descriptor script.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueEntry {
    /// File name of the entry; unique within the queue.
    pub name: String,
    /// Full path of the entry (the link itself, not its target).
    pub path: PathBuf,
}

impl QueueEntry {
    pub fn new(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self { name, path })
    }

    /// Resolve the descriptor script this entry refers to.
    ///
    /// Returns `Ok(None)` when the entry itself no longer exists, which
    /// means a racing turn already consumed it.
    pub fn descriptor(&self) -> std::io::Result<Option<PathBuf>> {
        let meta = match std::fs::symlink_metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !meta.file_type().is_symlink() {
            return Ok(Some(self.path.clone()));
        }
        let target = std::fs::read_link(&self.path)?;
        let target = if target.is_relative() {
            self.path
                .parent()
                .map(|dir| dir.join(&target))
                .unwrap_or(target)
        } else {
            target
        };
        Ok(Some(target))
    }
}

/// Directory the batch service should be invoked from for a descriptor.
///
/// Relative `#SBATCH --output` paths resolve against it.
pub fn submission_dir(descriptor: &Path) -> PathBuf {
    match descriptor.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Room left on the batch service for this identity, taken fresh each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub ceiling: usize,
    pub active: usize,
}

impl Capacity {
    pub fn new(ceiling: usize, active: usize) -> Self {
        Self { ceiling, active }
    }

    /// Slots that may still be filled; zero when the queue is at or over
    /// the ceiling.
    pub fn available(&self) -> usize {
        self.ceiling.saturating_sub(self.active)
    }

    pub fn is_exhausted(&self) -> bool {
        self.available() == 0
    }
}

// ---------------------------------------------------------------------------
// Turn results
// ---------------------------------------------------------------------------

/// A descriptor accepted by the batch service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub name: String,
    pub job_id: JobId,
}

/// A descriptor the batch service refused. Its entry stays queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedSubmission {
    pub name: String,
    pub error: String,
}

/// What one pass of the submission executor did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub submitted: Vec<Submission>,
    pub failed: Vec<FailedSubmission>,
    /// Entries that vanished before submission (consumed elsewhere).
    pub skipped: Vec<String>,
    /// The consecutive-failure breaker stopped the pass early.
    pub tripped: bool,
}

impl SubmissionReport {
    pub fn job_ids(&self) -> Vec<JobId> {
        self.submitted.iter().map(|s| s.job_id.clone()).collect()
    }
}

/// How a scheduling turn ended. Every variant is a successful turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// No room on the batch service; nothing attempted.
    QueueFull { capacity: Capacity },
    /// Another holder owns the scheduler lock and is draining.
    Denied { holder: Option<String> },
    /// This turn held the lock and drained up to capacity.
    Drained {
        capacity: Capacity,
        report: SubmissionReport,
        /// Entries still pending after the turn. `None` when the queue
        /// could not be listed afterwards.
        remaining: Option<usize>,
    },
}

impl TurnOutcome {
    pub fn submitted(&self) -> &[Submission] {
        match self {
            TurnOutcome::Drained { report, .. } => &report.submitted,
            _ => &[],
        }
    }

    /// Short label used for spans and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TurnOutcome::QueueFull { .. } => "queue_full",
            TurnOutcome::Denied { .. } => "denied",
            TurnOutcome::Drained { .. } => "drained",
        }
    }
}
