//! Shared test fixtures: a scripted batch service and scratch queues.

#![allow(dead_code)]

use cascade_rs::error::{Error, Result};
use cascade_rs::model::JobId;
use cascade_rs::queue::QueueStore;
use cascade_rs::slurm::BatchService;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// In-memory batch service with scripted rejections.
#[derive(Debug, Default)]
pub struct FakeBatch {
    /// What `active_count` reports.
    pub active: usize,
    /// Reject every submission.
    pub reject_all: bool,
    /// Reject descriptors with these file names.
    pub reject_names: HashSet<String>,
    /// Accept this many submissions, reject everything after.
    pub accept_first: Option<usize>,
    /// Every submit call, accepted or not: (descriptor, workdir).
    pub calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    /// Delete this directory right after accepting a submission.
    pub vanish_dir: Option<PathBuf>,
    pub accepted: Mutex<Vec<String>>,
}

impl FakeBatch {
    pub fn with_active(active: usize) -> Self {
        Self {
            active,
            ..Self::default()
        }
    }

    pub fn rejecting_all() -> Self {
        Self {
            reject_all: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn accepted_names(&self) -> Vec<String> {
        self.accepted.lock().unwrap().clone()
    }
}

impl BatchService for FakeBatch {
    async fn active_count(&self) -> Result<usize> {
        Ok(self.active)
    }

    async fn submit(&self, descriptor: &Path, workdir: &Path) -> Result<JobId> {
        let name = descriptor
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        self.calls
            .lock()
            .unwrap()
            .push((descriptor.to_path_buf(), workdir.to_path_buf()));

        let mut accepted = self.accepted.lock().unwrap();
        let over_quota = self.accept_first.is_some_and(|n| accepted.len() >= n);
        if self.reject_all || over_quota || self.reject_names.contains(&name) {
            return Err(Error::Command {
                command: "sbatch".to_string(),
                code: 1,
                stderr: "sbatch: error: Batch job submission failed".to_string(),
            });
        }

        accepted.push(name);
        if let Some(dir) = &self.vanish_dir {
            let _ = std::fs::remove_dir_all(dir);
        }
        Ok(JobId(format!("{}", 1000 + accepted.len())))
    }
}

/// Scratch directory holding `shfiles/` with one script per name and a
/// `queue_dir/` with all of them enqueued.
pub struct Scratch {
    pub dir: TempDir,
    pub store: QueueStore,
}

impl Scratch {
    pub fn shfiles(&self) -> PathBuf {
        self.dir.path().join("shfiles")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.dir.path().join("queue_dir")
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.store
            .list_pending()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    /// Write a descriptor script without queueing it.
    pub fn write_descriptor(&self, name: &str) -> PathBuf {
        let path = self.shfiles().join(format!("{name}.sh"));
        std::fs::write(&path, format!("#!/bin/bash\necho {name}\n")).unwrap();
        path
    }
}

pub fn scratch_queue(names: &[&str]) -> Scratch {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("shfiles")).unwrap();
    let store = QueueStore::open(dir.path().join("queue_dir")).unwrap();
    let scratch = Scratch { dir, store };
    for name in names {
        let path = scratch.write_descriptor(name);
        assert!(scratch.store.enqueue(&path).unwrap());
    }
    scratch
}

/// Names of `n` descriptors: job_000, job_001, ...
pub fn job_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("job_{i:03}")).collect()
}
