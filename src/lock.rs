//! Scheduler lock: one scheduling turn at a time per queue directory.
//!
//! The token is created with `O_CREAT | O_EXCL`, so of several jobs racing
//! for it exactly one wins. Losers are told who holds it and go away; nothing
//! here ever waits. A job that burns a compute slot waiting to schedule is
//! wasting the capacity being managed.
//!
//! A holder killed mid-turn leaves its token behind. Tokens older than the
//! configured staleness bound are broken and acquisition is tried once more.
//! Breaking is itself guarded by a second exclusive-create file, so of
//! several jobs that find the same stale token only one removes it, and a
//! token created in the meantime is never mistaken for the old one.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// File name of the lock token inside the queue directory.
pub const LOCK_FILE: &str = "scheduler.lock";

/// Held only while a stale token is being broken.
pub const BREAK_FILE: &str = "scheduler.lock.break";

const HOLDER_PREFIX: &str = "scheduler id = ";
const ACQUIRED_PREFIX: &str = "acquired at = ";

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    Acquired(LockGuard),
    /// Someone else holds the token. `holder` is what their token says,
    /// when readable.
    Denied { holder: Option<String> },
}

/// Held scheduler lock. Deletes the token on release or drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the token. Already gone is fine.
    pub fn release(mut self) {
        self.remove_token();
    }

    fn remove_token(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Held past the staleness bound, the token may have been broken and
        // taken by someone else.
        match read_token(&self.path) {
            Ok(None) => return,
            Ok(Some(text)) => {
                if let Some(holder) = holder_in(&text).filter(|h| *h != self.owner) {
                    warn!(owner = %self.owner, %holder, "scheduler lock was taken over, leaving it");
                    return;
                }
            }
            Err(_) => {}
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(owner = %self.owner, "scheduler lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(owner = %self.owner, error = %e, "failed to remove scheduler lock"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.remove_token();
    }
}

/// Settings for [`acquire`].
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Tokens older than this are treated as abandoned.
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60 * 60),
        }
    }
}

/// Try to take the scheduler lock for `owner` in `dir`. Never blocks.
pub fn acquire(dir: &Path, owner: &str, options: LockOptions) -> Result<Acquire> {
    let path = dir.join(LOCK_FILE);

    match try_create(&path, owner)? {
        Some(guard) => return Ok(Acquire::Acquired(guard)),
        None => {
            if !is_stale(&path, options.stale_after)? {
                return Ok(Acquire::Denied {
                    holder: read_holder(&path)?,
                });
            }
        }
    }

    if !break_stale(dir, &path, options.stale_after)? {
        return Ok(Acquire::Denied {
            holder: read_holder(&path)?,
        });
    }

    match try_create(&path, owner)? {
        Some(guard) => Ok(Acquire::Acquired(guard)),
        None => Ok(Acquire::Denied {
            holder: read_holder(&path)?,
        }),
    }
}

/// Remove a stale token while holding the break file. Returns `false` when
/// another job is breaking it or the token turned out to be live.
fn break_stale(dir: &Path, path: &Path, stale_after: Duration) -> Result<bool> {
    let marker = dir.join(BREAK_FILE);
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // A breaker killed mid-break leaves the marker; clear it for the
            // next turn.
            if is_stale(&marker, stale_after)? {
                remove_if_present(&marker)?;
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let broken = remove_if_stale(path, stale_after);
    remove_if_present(&marker)?;
    broken
}

fn remove_if_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    // Checked again under the marker: another breaker may already have
    // replaced the token with a fresh one.
    if !is_stale(path, stale_after)? {
        return Ok(false);
    }
    warn!(
        holder = read_holder(path)?.as_deref().unwrap_or("unknown"),
        stale_after_secs = stale_after.as_secs(),
        "breaking stale scheduler lock"
    );
    remove_if_present(path)?;
    Ok(true)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Identity recorded in the current token, if there is one.
pub fn holder(dir: &Path) -> Result<Option<String>> {
    read_holder(&dir.join(LOCK_FILE))
}

fn try_create(path: &Path, owner: &str) -> Result<Option<LockGuard>> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // From here on the guard owns the token and cleans it up on any error.
    let guard = LockGuard {
        path: path.to_path_buf(),
        owner: owner.to_string(),
        released: false,
    };
    write!(
        file,
        "{HOLDER_PREFIX}{owner}\n{ACQUIRED_PREFIX}{}\n",
        Utc::now().to_rfc3339()
    )?;
    file.sync_all()?;
    drop(file);

    // The exclusive create already decided the winner; this only catches a
    // stale-lock breaker deleting our fresh token between create and write.
    if read_holder(path)?.as_deref() != Some(owner) {
        let mut guard = guard;
        // Not ours any more; must not delete someone else's token.
        guard.released = true;
        warn!(owner, "scheduler lock replaced right after acquisition");
        return Ok(None);
    }

    debug!(owner, "scheduler lock acquired");
    Ok(Some(guard))
}

fn read_token(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_holder(path: &Path) -> Result<Option<String>> {
    Ok(read_token(path)?.and_then(|text| holder_in(&text)))
}

fn holder_in(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix(HOLDER_PREFIX))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn acquired_at(text: &str) -> Option<DateTime<Utc>> {
    text.lines()
        .find_map(|line| line.strip_prefix(ACQUIRED_PREFIX))
        .and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn is_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    let Some(text) = read_token(path)? else {
        // Vanished between our create and now; let the retry sort it out.
        return Ok(true);
    };

    let age = match acquired_at(&text) {
        Some(at) => (Utc::now() - at).to_std().unwrap_or(Duration::ZERO),
        // Half-written or foreign token: fall back to the file's mtime.
        None => match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().unwrap_or(Duration::ZERO),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        },
    };
    Ok(age > stale_after)
}
