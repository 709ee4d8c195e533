//! Directory-resident work queue.
//!
//! Each pending job is a symlink in the queue directory pointing at its
//! descriptor script. There is no index file and no cursor: the directory
//! listing, sorted by name, is the queue. Every operation is safe to repeat
//! and safe to race with other processes doing the same.

use crate::error::{Error, Result};
use crate::model::QueueEntry;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Only entries with this suffix are queue entries. Keeps the lock token
/// and anything else dropped in the directory out of the listing.
pub const DESCRIPTOR_SUFFIX: &str = ".sh";

/// Handle on a queue directory.
#[derive(Debug, Clone)]
pub struct QueueStore {
    dir: PathBuf,
}

impl QueueStore {
    /// Open a queue directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Link a descriptor into the queue.
    ///
    /// Keyed by the descriptor's file name. Returns `false` when an entry
    /// with that name already exists; reruns of a seeding step are no-ops.
    pub fn enqueue(&self, descriptor: &Path) -> Result<bool> {
        let name = descriptor
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.ends_with(DESCRIPTOR_SUFFIX))
            .ok_or_else(|| {
                Error::Other(format!(
                    "descriptor {} must be a file name ending in {DESCRIPTOR_SUFFIX}",
                    descriptor.display()
                ))
            })?;

        // Absolute targets keep the link valid no matter where it is read from.
        let target = if descriptor.is_absolute() {
            descriptor.to_path_buf()
        } else {
            std::env::current_dir()?.join(descriptor)
        };

        let link = self.dir.join(name);
        match std::os::unix::fs::symlink(&target, &link) {
            Ok(()) => {
                debug!(entry = name, target = %target.display(), "enqueued");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of pending entries in name order.
    pub fn list_pending(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(DESCRIPTOR_SUFFIX) || name.starts_with('.') {
                continue;
            }
            // Directories named *.sh are not entries.
            if dirent.file_type()?.is_dir() {
                continue;
            }
            entries.push(QueueEntry {
                name,
                path: dirent.path(),
            });
        }
        entries.sort();
        Ok(entries)
    }

    /// Whether an entry named `name` is linked in, dangling or not.
    pub fn contains(&self, name: &str) -> Result<bool> {
        match std::fs::symlink_metadata(self.dir.join(name)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.list_pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Unlink an entry. Returns `false` if it was already gone.
    pub fn remove(&self, entry: &QueueEntry) -> Result<bool> {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
