//! Durable JSON persistence under `.ralph/`.
//!
//! Every write goes through temp-file + fsync + atomic rename so that a
//! crash between any two instructions leaves the previous committed
//! version intact. Readers never observe a partial write.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ProjectPaths;
use crate::error::{RalphError, Result};
use crate::model::{ImplementationPlan, Injection, RalphState, SessionArchive};

mod lock;

pub use lock::{LockGuard, LockInfo};

/// Persistence layer for orchestrator state. One instance per project root;
/// the `.ralph/` directory is exclusively owned by the orchestrator process.
#[derive(Debug, Clone)]
pub struct Store {
    paths: ProjectPaths,
}

impl Store {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: ProjectPaths::new(project_root),
        }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Create the `.ralph/` tree and remove temp leftovers from
    /// interrupted writes.
    pub async fn ensure_ralph_dir(&self) -> Result<()> {
        self.paths.ensure_dirs().await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.paths.ralph_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    async fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| RalphError::from_io(e, &tmp_path))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| RalphError::from_io(e, &tmp_path))?;
        file.sync_all()
            .await
            .map_err(|e| RalphError::from_io(e, &tmp_path))?;
        drop(file);

        // POSIX guarantees rename atomicity within one filesystem
        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(RalphError::from_io(e, path));
        }

        debug!(path = %path.display(), "Atomic write committed");
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RalphError::StateNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(RalphError::from_io(e, path)),
        };
        serde_json::from_str(&content).map_err(|e| RalphError::CorruptedState {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    // --- State ---

    pub async fn load_state(&self) -> Result<RalphState> {
        self.read_json(&self.paths.state_file).await
    }

    /// Faithful write: `save_state(load_state(x))` reproduces `x` exactly.
    /// Activity timestamps are the model's concern, not the store's.
    pub async fn save_state(&self, state: &RalphState) -> Result<()> {
        self.write_atomic(&self.paths.state_file, state).await
    }

    pub fn state_exists(&self) -> bool {
        self.paths.state_file.exists()
    }

    pub async fn initialize_state(&self) -> Result<RalphState> {
        let state = RalphState::new(&self.paths.root);
        self.save_state(&state).await?;
        Ok(state)
    }

    // --- Plan ---

    pub async fn load_plan(&self) -> Result<ImplementationPlan> {
        self.read_json(&self.paths.plan_file).await
    }

    pub async fn save_plan(&self, plan: &ImplementationPlan) -> Result<()> {
        self.write_atomic(&self.paths.plan_file, plan).await
    }

    pub fn plan_exists(&self) -> bool {
        self.paths.plan_file.exists()
    }

    pub async fn initialize_plan(&self) -> Result<ImplementationPlan> {
        let plan = ImplementationPlan::new();
        self.save_plan(&plan).await?;
        Ok(plan)
    }

    // --- Injections (newline-delimited JSON, appended between iterations) ---

    pub async fn load_injections(&self) -> Result<Vec<Injection>> {
        let path = &self.paths.injections_file;
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RalphError::from_io(e, path)),
        };

        let mut injections = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Injection>(line) {
                Ok(injection) => injections.push(injection),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted injection line");
                }
            }
        }
        Injection::sort(&mut injections);
        Ok(injections)
    }

    pub async fn add_injection(&self, injection: &Injection) -> Result<()> {
        let path = &self.paths.injections_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RalphError::from_io(e, parent))?;
        }
        let mut line = serde_json::to_string(injection)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| RalphError::from_io(e, path))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RalphError::from_io(e, path))?;
        Ok(())
    }

    /// Injections live for exactly one iteration.
    pub async fn clear_injections(&self) -> Result<()> {
        let path = &self.paths.injections_file;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RalphError::from_io(e, path)),
        }
    }

    // --- Session archive (jsonl, append-only) ---

    pub async fn append_session_archive(&self, archive: &SessionArchive) -> Result<()> {
        let path = self.paths.sessions_log();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RalphError::from_io(e, parent))?;
        }
        let mut line = serde_json::to_string(archive)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RalphError::from_io(e, &path))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RalphError::from_io(e, &path))?;
        file.sync_all()
            .await
            .map_err(|e| RalphError::from_io(e, &path))?;
        info!(session_id = %archive.session_id, reason = %archive.handoff_reason, "Session archived");
        Ok(())
    }

    /// Most recent first, capped at `limit`.
    pub async fn load_session_archive(&self, limit: usize) -> Result<Vec<SessionArchive>> {
        let path = self.paths.sessions_log();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RalphError::from_io(e, &path)),
        };

        let mut sessions = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionArchive>(line) {
                Ok(archive) => sessions.push(archive),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted session archive line");
                }
            }
        }
        sessions.reverse();
        sessions.truncate(limit);
        Ok(sessions)
    }

    // --- Progress log (append-only learnings) ---

    pub async fn append_progress(&self, category: &str, text: &str) -> Result<()> {
        let path = &self.paths.progress_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| RalphError::from_io(e, parent))?;
        }
        let line = format!(
            "[{}] [{}] {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            category,
            text.replace('\n', " ")
        );
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| RalphError::from_io(e, path))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RalphError::from_io(e, path))?;
        Ok(())
    }

    // --- Advisory lock ---

    pub async fn acquire_lock(&self) -> Result<LockGuard> {
        lock::acquire(&self.paths.lock_file).await
    }
}
