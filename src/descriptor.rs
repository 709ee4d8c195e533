//! Job descriptors: the results-directory layout, the TOML job manifest,
//! and the batch script written for each job.
//!
//! Commands arrive fully formed in the manifest; this module only wraps
//! each one in a script whose first act is the cascade entry.

use crate::error::{Error, Result};
use crate::queue::{DESCRIPTOR_SUFFIX, QueueStore};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Directories under a results root.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Descriptor scripts and the batch service's per-job output files.
    pub fn shfiles(&self) -> PathBuf {
        self.root.join("shfiles")
    }

    /// The work queue.
    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue_dir")
    }

    /// Working directory of every payload.
    pub fn results(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn create(&self) -> Result<()> {
        for dir in [self.shfiles(), self.queue_dir(), self.results()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Top-level TOML document.
#[derive(Debug, Deserialize)]
pub struct JobManifest {
    #[serde(default)]
    pub defaults: JobDefaults,
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobSpec>,
}

/// Batch directives shared by every job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub time: String,
    pub ntasks: u32,
    /// Memory per node, in the batch service's own syntax.
    pub mem: String,
    /// Address for failure notifications.
    pub mail_user: Option<String>,
    /// Shell lines run before the cascade entry, e.g. activating an
    /// environment.
    pub prologue: Vec<String>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            time: "7-00:00:00".to_string(),
            ntasks: 1,
            mem: "100".to_string(),
            mail_user: None,
            prologue: Vec::new(),
        }
    }
}

/// One job: a name and a ready-to-run shell command.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
}

impl JobManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate. `path` is only used in error messages.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let manifest: JobManifest = toml::from_str(content).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| Error::Manifest {
            path: path.to_path_buf(),
            reason,
        };

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !is_valid_name(&job.name) {
                return Err(invalid(format!(
                    "job name {:?} must be non-empty and use only letters, digits, '.', '_' or '-'",
                    job.name
                )));
            }
            if job.command.trim().is_empty() {
                return Err(invalid(format!("job {:?} has an empty command", job.name)));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(invalid(format!("duplicate job name {:?}", job.name)));
            }
        }
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// Script rendering
// ---------------------------------------------------------------------------

/// Render the batch script for one job.
///
/// The script changes into the payload directory and hands over to
/// `cascade enter`, which runs one scheduling turn and the balancer before
/// the payload. No `set -e`: a failed scheduling phase must not cost the
/// job its payload.
pub fn render_script(
    job: &JobSpec,
    defaults: &JobDefaults,
    layout: &Layout,
    cascade_bin: &Path,
) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH --job-name={}", job.name),
        format!("#SBATCH --time={}", defaults.time),
        format!("#SBATCH --ntasks={}", defaults.ntasks),
        format!("#SBATCH --mem={}", defaults.mem),
        format!("#SBATCH --output={}_%j.out", job.name),
    ];
    if let Some(mail) = &defaults.mail_user {
        lines.push(format!("#SBATCH --mail-user={mail}"));
        lines.push("#SBATCH --mail-type=FAIL".to_string());
    }
    lines.push(String::new());

    if !defaults.prologue.is_empty() {
        lines.extend(defaults.prologue.iter().cloned());
        lines.push(String::new());
    }

    lines.push(format!("cd {}", shell_quote(&layout.results().display().to_string())));
    lines.push(format!(
        "exec {} enter --queue-dir {} --results-dir {} -- /bin/bash -c {}",
        shell_quote(&cascade_bin.display().to_string()),
        shell_quote(&layout.queue_dir().display().to_string()),
        shell_quote(&layout.root.display().to_string()),
        shell_quote(&job.command),
    ));
    lines.push(String::new());
    lines.join("\n")
}

/// Single-quote a string for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Result of seeding a queue from a manifest.
#[derive(Debug, Clone, Default)]
pub struct SeedReport {
    /// Descriptor scripts written.
    pub written: usize,
    /// Entries newly linked into the queue.
    pub enqueued: usize,
    /// Entries that were already queued.
    pub already_queued: usize,
    /// Jobs whose script exists but whose entry is gone: submitted by an
    /// earlier cascade and left alone.
    pub already_submitted: usize,
}

/// Write every manifest job's script into the layout and queue it.
///
/// Safe to rerun. A job whose script is already in `shfiles/` but has no
/// queue entry was consumed by an earlier cascade and is skipped, unless
/// `requeue` is set; its script is not rewritten either, since the batch
/// service may still be holding it.
pub fn seed(
    manifest: &JobManifest,
    layout: &Layout,
    cascade_bin: &Path,
    requeue: bool,
) -> Result<SeedReport> {
    layout.create()?;
    // Scripts run from elsewhere, so every path baked into them is absolute.
    let layout = &Layout::new(std::fs::canonicalize(&layout.root)?);
    let store = QueueStore::open(layout.queue_dir())?;
    let shfiles = layout.shfiles();

    let mut report = SeedReport::default();
    for job in &manifest.jobs {
        let file_name = format!("{}{DESCRIPTOR_SUFFIX}", job.name);
        let path = shfiles.join(&file_name);

        if !requeue && path.exists() && !store.contains(&file_name)? {
            debug!(job = %job.name, "already submitted, not requeueing");
            report.already_submitted += 1;
            continue;
        }

        let script = render_script(job, &manifest.defaults, layout, cascade_bin);
        write_executable(&path, &script)?;
        report.written += 1;

        if store.enqueue(&path)? {
            report.enqueued += 1;
        } else {
            report.already_queued += 1;
        }
        debug!(job = %job.name, path = %path.display(), "descriptor written");
    }

    info!(
        written = report.written,
        enqueued = report.enqueued,
        already_queued = report.already_queued,
        already_submitted = report.already_submitted,
        "queue seeded"
    );
    if report.already_submitted > 0 && !requeue {
        warn!(
            skipped = report.already_submitted,
            "some jobs were submitted by an earlier run; pass --requeue to submit them again"
        );
    }
    Ok(report)
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}
