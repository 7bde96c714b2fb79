//! Advisory lock preventing two orchestrators on one project root.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{RalphError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    pub fn is_process_alive(&self) -> bool {
        is_process_running(self.pid)
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

/// Guard that removes the lock file on drop (best effort; a crashed
/// process leaves a stale lock that the next acquire replaces).
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RalphError::from_io(e, &self.path)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub async fn acquire(lock_path: &Path) -> Result<LockGuard> {
    if let Some(existing) = read(lock_path).await? {
        if existing.is_process_alive() && existing.pid != std::process::id() {
            return Err(RalphError::LockHeld {
                pid: existing.pid,
                started_at: existing.started_at.to_rfc3339(),
            });
        }
        info!(old_pid = existing.pid, "Replacing stale lock");
    }

    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| RalphError::from_io(e, parent))?;
    }

    let info = LockInfo::current();
    let content = serde_json::to_string(&info)?;
    let tmp_path = lock_path.with_extension(format!("{}.tmp", info.pid));
    fs::write(&tmp_path, &content)
        .await
        .map_err(|e| RalphError::from_io(e, &tmp_path))?;
    if let Err(e) = fs::rename(&tmp_path, lock_path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(RalphError::from_io(e, lock_path));
    }

    debug!(pid = info.pid, path = %lock_path.display(), "Lock acquired");
    Ok(LockGuard {
        path: lock_path.to_path_buf(),
        released: false,
    })
}

async fn read(lock_path: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(lock_path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            // An unreadable lock is treated as stale rather than fatal
            Err(_) => Ok(None),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RalphError::from_io(e, lock_path)),
    }
}
