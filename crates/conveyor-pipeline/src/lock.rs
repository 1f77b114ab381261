//! Exclusive lock files guarding the registry and job workspaces.
//!
//! A lock is a file created with `O_CREAT | O_EXCL` holding the owner's pid and
//! a random token. Dropping the guard removes the file, but only while it still
//! carries our token. A lock whose holder process is gone, or that is older than
//! the caller's staleness limit, is broken and re-acquired.
//!
//! Breaking happens under a second exclusive file, `<lock>.break`, so at most one
//! contender removes a given stale holder; everyone else re-reads the lock and
//! competes through `create_new` again.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use conveyor_types::{ConveyorError, Result};

/// How long to wait between acquisition attempts while a lock is held.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Age after which an unreadable lock file is treated as abandoned mid-write.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// Age after which a leftover break guard is assumed to belong to a crashed process.
const BREAK_GUARD_GRACE: Duration = Duration::from_secs(5);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub token: String,
    pub acquired_at: String,
}

/// Result of a single, non-blocking acquisition attempt.
#[derive(Debug)]
pub enum TryLock {
    Acquired(LockFile),
    Held(LockHolder),
}

/// Guard for an acquired lock file.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockFile {
    /// Attempt to take the lock once, breaking it first if it is stale.
    pub async fn try_acquire(path: &Path, stale_after: Option<Duration>) -> Result<TryLock> {
        // Two passes: the second one runs after a stale lock was removed.
        for _ in 0..2 {
            let holder = LockHolder {
                pid: std::process::id(),
                token: uuid::Uuid::new_v4().simple().to_string(),
                acquired_at: chrono::Utc::now().to_rfc3339(),
            };
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let payload = serde_json::to_vec(&holder)?;
                    file.write_all(&payload).await?;
                    file.sync_all().await?;
                    tracing::debug!(path = %path.display(), "Lock acquired");
                    return Ok(TryLock::Acquired(LockFile {
                        path: path.to_path_buf(),
                        token: holder.token,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let current = read_holder(path).await;
                    if !is_stale(path, current.as_ref(), stale_after).await {
                        return Ok(TryLock::Held(current.unwrap_or_else(unknown_holder)));
                    }
                    if !break_stale(path, current.as_ref(), stale_after).await? {
                        return Ok(TryLock::Held(current.unwrap_or_else(unknown_holder)));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        let holder = read_holder(path).await.unwrap_or_else(unknown_holder);
        Ok(TryLock::Held(holder))
    }

    /// Poll until the lock is acquired or `timeout` elapses.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Option<Duration>,
    ) -> Result<LockFile> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(path, stale_after).await? {
                TryLock::Acquired(lock) => return Ok(lock),
                TryLock::Held(holder) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(path = %path.display(), pid = holder.pid, "Lock wait timed out");
                        return Err(ConveyorError::LockTimeout {
                            path: path.display().to_string(),
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point the guard at a new location after its directory was renamed.
    pub fn relocate(&mut self, new_path: PathBuf) {
        self.path = new_path;
    }

    /// Release the lock now instead of waiting for drop.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if owned_by(&self.path, &self.token) {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.released && owned_by(&self.path, &self.token) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn unknown_holder() -> LockHolder {
    LockHolder {
        pid: 0,
        token: String::new(),
        acquired_at: String::new(),
    }
}

fn break_guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".break");
    PathBuf::from(name)
}

/// Remove the lock at `path` if it still carries `seen` and is still stale.
///
/// Returns `false` when another contender is breaking the same lock right now.
async fn break_stale(
    path: &Path,
    seen: Option<&LockHolder>,
    stale_after: Option<Duration>,
) -> Result<bool> {
    let guard = break_guard_path(path);
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&guard)
        .await
    {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if file_age(&guard).await.is_some_and(|age| age > BREAK_GUARD_GRACE) {
                tracing::warn!(path = %guard.display(), "Removing abandoned break guard");
                let _ = tokio::fs::remove_file(&guard).await;
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let outcome = async {
        let current = read_holder(path).await;
        if current.as_ref() != seen || !is_stale(path, current.as_ref(), stale_after).await {
            return Ok(());
        }
        tracing::warn!(path = %path.display(), holder = ?seen, "Breaking stale lock");
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
    .await;
    let _ = tokio::fs::remove_file(&guard).await;
    outcome?;
    Ok(true)
}

async fn file_age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn owned_by(path: &Path, token: &str) -> bool {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockHolder>(&bytes).ok())
        .is_some_and(|holder| holder.token == token)
}

async fn read_holder(path: &Path) -> Option<LockHolder> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn is_stale(path: &Path, holder: Option<&LockHolder>, stale_after: Option<Duration>) -> bool {
    let limit = match holder {
        Some(holder) if !process_alive(holder.pid) => return true,
        Some(_) => match stale_after {
            Some(limit) => limit,
            None => return false,
        },
        None => stale_after.unwrap_or(UNREADABLE_GRACE),
    };
    file_age(path).await.is_some_and(|age| age > limit)
}

#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks without sending anything.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn process_alive(pid: u32) -> bool {
    pid != 0
}
