//! Deterministic memory capture and retrieval.
//!
//! The orchestrator (never the executor) captures structured markdown at
//! three boundaries: iteration end, phase transition, and session hand-off.
//! The same files are read back to assemble the bounded "active memory"
//! string injected into the next prompt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::MemoryLimits;
use crate::error::{RalphError, Result};
use crate::model::{ImplementationPlan, Phase, RalphState, TaskStatus};

mod records;

pub use records::{IterationMemory, MemoryStats, PhaseMemory, SessionMemory};

const TRUNCATION_MARKER: &str = "\n\n...(truncated)";
const PREV_PHASE_CHARS: usize = 1500;
const CURRENT_PHASE_CHARS: usize = 1000;
const RECENT_ITERATIONS: usize = 3;

/// Manages the `.ralph/memory/` tree and `.ralph/MEMORY.md`.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    memory_dir: PathBuf,
    memory_file: PathBuf,
    limits: MemoryLimits,
}

impl MemoryManager {
    pub fn new(ralph_dir: &Path, limits: MemoryLimits) -> Self {
        Self {
            memory_dir: ralph_dir.join("memory"),
            memory_file: ralph_dir.join("MEMORY.md"),
            limits,
        }
    }

    fn phases_dir(&self) -> PathBuf {
        self.memory_dir.join("phases")
    }

    fn iterations_dir(&self) -> PathBuf {
        self.memory_dir.join("iterations")
    }

    fn sessions_dir(&self) -> PathBuf {
        self.memory_dir.join("sessions")
    }

    fn archive_dir(&self) -> PathBuf {
        self.memory_dir.join("archive")
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.phases_dir(),
            self.iterations_dir(),
            self.sessions_dir(),
            self.archive_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| RalphError::from_io(e, &dir))?;
        }
        Ok(())
    }

    // --- Capture ---

    /// Write `memory/iterations/iter-NNN.md` for the iteration that just
    /// finished.
    pub async fn capture_iteration(
        &self,
        state: &RalphState,
        plan: &ImplementationPlan,
        progress_made: bool,
        tokens_used: u64,
        cost_usd: f64,
        error: Option<&str>,
    ) -> Result<PathBuf> {
        let mem = IterationMemory {
            iteration: state.iteration_count,
            phase: state.current_phase,
            timestamp: Utc::now(),
            tasks_completed: ids_with_status(plan, TaskStatus::Complete),
            tasks_blocked: ids_with_status(plan, TaskStatus::Blocked),
            progress_made,
            tokens_used,
            cost_usd,
            error: error.map(|e| e.to_string()),
        };

        self.ensure_dirs().await?;
        let path = self
            .iterations_dir()
            .join(format!("iter-{:03}.md", mem.iteration));
        fs::write(&path, format_iteration(&mem))
            .await
            .map_err(|e| RalphError::from_io(e, &path))?;
        debug!(path = %path.display(), "Iteration memory captured");
        Ok(path)
    }

    /// Write `memory/phases/<phase>.md`, overwriting any previous capture
    /// of the same phase.
    pub async fn capture_phase_transition(
        &self,
        state: &RalphState,
        completed_phase: Phase,
        artifacts: BTreeMap<String, serde_json::Value>,
        summary: impl Into<String>,
    ) -> Result<PathBuf> {
        let mem = PhaseMemory {
            phase: completed_phase,
            completed_at: Utc::now(),
            iterations_in_phase: state.iteration_count,
            artifacts,
            summary: summary.into(),
        };

        self.ensure_dirs().await?;
        let path = self
            .phases_dir()
            .join(format!("{}.md", completed_phase.as_str()));
        fs::write(&path, format_phase(&mem))
            .await
            .map_err(|e| RalphError::from_io(e, &path))?;
        debug!(phase = %completed_phase, "Phase memory captured");
        Ok(path)
    }

    /// Write `memory/sessions/session-NNN.md` at a hand-off.
    pub async fn capture_session_handoff(
        &self,
        state: &RalphState,
        plan: &ImplementationPlan,
        handoff_reason: &str,
    ) -> Result<PathBuf> {
        let mem = SessionMemory {
            session_id: state
                .session_id
                .clone()
                .unwrap_or_else(|| format!("session-{}", state.iteration_count)),
            phase: state.current_phase,
            iteration: state.iteration_count,
            handoff_reason: handoff_reason.to_string(),
            tasks_in_progress: ids_with_status(plan, TaskStatus::InProgress),
            tokens_used: state.session_tokens_used,
            cost_usd: state.session_cost_usd,
        };

        self.ensure_dirs().await?;
        let next_num = self.count_files(&self.sessions_dir(), "session-").await + 1;
        let path = self.sessions_dir().join(format!("session-{:03}.md", next_num));
        fs::write(&path, format_session(&mem))
            .await
            .map_err(|e| RalphError::from_io(e, &path))?;
        debug!(session = %mem.session_id, "Session memory captured");
        Ok(path)
    }

    // --- Retrieval ---

    pub async fn load_phase_memory(&self, phase: Phase) -> Option<String> {
        let path = self.phases_dir().join(format!("{}.md", phase.as_str()));
        fs::read_to_string(&path).await.ok()
    }

    /// Most recent iteration files first, capped at `limit`.
    async fn recent_iteration_files(&self, limit: usize) -> Vec<PathBuf> {
        let mut files = self.list_files(&self.iterations_dir(), "iter-").await;
        files.sort();
        files.reverse();
        files.truncate(limit);
        files
    }

    /// Compose the bounded active-memory string for prompt injection.
    /// Section order: previous phase, current phase, recent iterations,
    /// task state, session metrics. Truncated from the tail to the cap.
    pub async fn build_active_memory(
        &self,
        state: &RalphState,
        plan: &ImplementationPlan,
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        if let Some(prev) = state.current_phase.previous() {
            if let Some(content) = self.load_phase_memory(prev).await {
                sections.push(format!(
                    "## From {} Phase\n{}",
                    title_case(prev.as_str()),
                    clip(&content, PREV_PHASE_CHARS)
                ));
            }
        }

        if let Some(content) = self.load_phase_memory(state.current_phase).await {
            sections.push(format!(
                "## Current Phase ({})\n{}",
                state.current_phase,
                clip(&content, CURRENT_PHASE_CHARS)
            ));
        }

        let recent = self.recent_iteration_files(RECENT_ITERATIONS).await;
        if !recent.is_empty() {
            let mut lines = Vec::new();
            for path in &recent {
                if let Ok(content) = fs::read_to_string(path).await {
                    if let Some(first) = content.lines().next() {
                        lines.push(format!("- {}", first.trim_start_matches('#').trim()));
                    }
                }
            }
            if !lines.is_empty() {
                sections.push(format!("## Recent Progress\n{}", lines.join("\n")));
            }
        }

        sections.push(format!("## Task State\n{}", format_task_state(plan)));
        sections.push(format!("## Session Metrics\n{}", format_metrics(state)));

        let combined = sections.join("\n\n");
        if combined.len() > self.limits.max_active_memory_chars {
            let keep = self
                .limits
                .max_active_memory_chars
                .saturating_sub(TRUNCATION_MARKER.len());
            format!("{}{}", clip(&combined, keep), TRUNCATION_MARKER)
        } else {
            combined
        }
    }

    /// Rewrite `.ralph/MEMORY.md`, the human-facing hand-off rendering.
    pub async fn write_memory_file(
        &self,
        state: &RalphState,
        plan: &ImplementationPlan,
        summary: Option<&str>,
    ) -> Result<PathBuf> {
        let content = render_memory_markdown(state, plan, summary);
        fs::write(&self.memory_file, content)
            .await
            .map_err(|e| RalphError::from_io(e, &self.memory_file))?;
        Ok(self.memory_file.clone())
    }

    /// Apply a queued update-memory tool payload.
    pub async fn apply_memory_update(
        &self,
        content: &str,
        append: bool,
    ) -> Result<()> {
        let new_content = if append && self.memory_file.exists() {
            let existing = fs::read_to_string(&self.memory_file)
                .await
                .map_err(|e| RalphError::from_io(e, &self.memory_file))?;
            format!("{}\n{}", existing.trim_end(), content)
        } else {
            content.to_string()
        };
        fs::write(&self.memory_file, new_content)
            .await
            .map_err(|e| RalphError::from_io(e, &self.memory_file))?;
        Ok(())
    }

    // --- Rotation ---

    /// Move the oldest files beyond the per-type caps into `archive/`,
    /// then delete archive entries past the retention window. Returns
    /// (rotated, deleted).
    pub async fn rotate(&self) -> Result<(usize, usize)> {
        self.ensure_dirs().await?;
        let mut rotated = 0;
        rotated += self
            .rotate_dir(&self.iterations_dir(), "iter-", self.limits.max_iteration_files)
            .await?;
        rotated += self
            .rotate_dir(&self.sessions_dir(), "session-", self.limits.max_session_files)
            .await?;

        let deleted = self.cleanup_archive().await?;
        Ok((rotated, deleted))
    }

    async fn rotate_dir(&self, dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
        let mut files = self.list_files(dir, prefix).await;
        if files.len() <= keep {
            return Ok(0);
        }
        // Names are zero-padded, so lexical order is chronological.
        files.sort();
        let excess = files.len() - keep;
        let mut rotated = 0;
        for path in files.into_iter().take(excess) {
            let file_name = match path.file_name() {
                Some(name) => name.to_os_string(),
                None => continue,
            };
            let target = self.archive_dir().join(file_name);
            match fs::rename(&path, &target).await {
                Ok(()) => rotated += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to archive memory file"),
            }
        }
        Ok(rotated)
    }

    async fn cleanup_archive(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.limits.archive_retention_days);
        let mut deleted = 0;

        let mut entries = match fs::read_dir(self.archive_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let modified: chrono::DateTime<Utc> = modified.into();
            if modified < cutoff {
                match fs::remove_file(&path).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete archived memory"),
                }
            }
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            iteration_files: self.count_files(&self.iterations_dir(), "iter-").await,
            session_files: self.count_files(&self.sessions_dir(), "session-").await,
            phase_files: self.count_files(&self.phases_dir(), "").await,
            archive_files: self.count_files(&self.archive_dir(), "").await,
            total_size_bytes: 0,
        };
        for dir in [
            self.phases_dir(),
            self.iterations_dir(),
            self.sessions_dir(),
            self.archive_dir(),
        ] {
            if let Ok(mut entries) = fs::read_dir(&dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Ok(metadata) = entry.metadata().await {
                        if metadata.is_file() {
                            stats.total_size_bytes += metadata.len();
                        }
                    }
                }
            }
        }
        stats
    }

    /// Remove the entire memory tree (used by `clean --memory`).
    pub async fn wipe(&self) -> Result<()> {
        match fs::remove_dir_all(&self.memory_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RalphError::from_io(e, &self.memory_dir)),
        }
        match fs::remove_file(&self.memory_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RalphError::from_io(e, &self.memory_file)),
        }
    }

    async fn list_files(&self, dir: &Path, prefix: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return files;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_match = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix))
                .unwrap_or(false);
            if is_match && path.is_file() {
                files.push(path);
            }
        }
        files
    }

    async fn count_files(&self, dir: &Path, prefix: &str) -> usize {
        self.list_files(dir, prefix).await.len()
    }
}

fn ids_with_status(plan: &ImplementationPlan, status: TaskStatus) -> Vec<String> {
    plan.tasks
        .iter()
        .filter(|t| t.status == status)
        .map(|t| t.id.clone())
        .collect()
}

fn clip(s: &str, max_chars: usize) -> &str {
    if s.len() <= max_chars {
        return s;
    }
    // Back off to a char boundary so we never split a code point.
    let mut end = max_chars;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "- None".to_string()
    } else {
        items
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn format_iteration(mem: &IterationMemory) -> String {
    let error_section = mem
        .error
        .as_deref()
        .map(|e| format!("\n### Error\n{}\n", e))
        .unwrap_or_default();

    format!(
        "## Iteration {} ({})\n\n\
         **Time**: {}\n\
         **Progress**: {} | Tokens: {} | Cost: ${:.4}\n\n\
         ### Tasks Completed\n{}\n\n\
         ### Tasks Blocked\n{}\n{}",
        mem.iteration,
        mem.phase,
        mem.timestamp.format("%Y-%m-%d %H:%M"),
        if mem.progress_made { "Yes" } else { "No" },
        mem.tokens_used,
        mem.cost_usd,
        list_or_none(&mem.tasks_completed),
        list_or_none(&mem.tasks_blocked),
        error_section,
    )
}

fn format_phase(mem: &PhaseMemory) -> String {
    let artifacts = if mem.artifacts.is_empty() {
        "- None".to_string()
    } else {
        mem.artifacts
            .iter()
            .map(|(k, v)| format!("- **{}**: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# {} Phase Memory\n\n\
         **Completed**: {}\n\
         **Iterations**: {}\n\n\
         ## Summary\n{}\n\n\
         ## Artifacts\n{}\n",
        title_case(mem.phase.as_str()),
        mem.completed_at.format("%Y-%m-%d %H:%M"),
        mem.iterations_in_phase,
        mem.summary,
        artifacts,
    )
}

fn format_session(mem: &SessionMemory) -> String {
    let in_progress = if mem.tasks_in_progress.is_empty() {
        "None".to_string()
    } else {
        mem.tasks_in_progress.join(", ")
    };

    format!(
        "# Session Handoff Memory\n\n\
         **Session ID**: {}\n\
         **Phase**: {}\n\
         **Iteration**: {}\n\
         **Handoff Reason**: {}\n\n\
         ## Tasks In Progress\n{}\n\n\
         ## Session Metrics\n\
         - Tokens used: {}\n\
         - Cost: ${:.4}\n",
        mem.session_id,
        mem.phase,
        mem.iteration,
        mem.handoff_reason,
        in_progress,
        mem.tokens_used,
        mem.cost_usd,
    )
}

fn format_task_state(plan: &ImplementationPlan) -> String {
    if plan.tasks.is_empty() {
        return "No tasks defined".to_string();
    }

    let total = plan.tasks.len();
    let complete = plan.complete_count();
    let mut lines = vec![
        format!("- Total: {} tasks", total),
        format!(
            "- Complete: {} ({:.0}%)",
            complete,
            plan.completion_percentage() * 100.0
        ),
    ];

    let in_progress = ids_with_status(plan, TaskStatus::InProgress);
    if !in_progress.is_empty() {
        lines.push(format!("- In Progress: {}", in_progress.join(", ")));
    }
    let blocked = ids_with_status(plan, TaskStatus::Blocked);
    if !blocked.is_empty() {
        lines.push(format!("- Blocked: {}", blocked.join(", ")));
    }

    lines.join("\n")
}

fn format_metrics(state: &RalphState) -> String {
    format!(
        "- Iteration: {}\n\
         - Session iterations: {}\n\
         - Session cost: ${:.4}\n\
         - Session tokens: {}\n\
         - Tasks this session: {}",
        state.iteration_count,
        state.session_iteration_count,
        state.session_cost_usd,
        state.session_tokens_used,
        state.tasks_completed_this_session,
    )
}

/// Files listed in the MEMORY.md hand-off before the list is elided.
const MAX_FILES_IN_MEMORY: usize = 10;

/// Full `.ralph/MEMORY.md` rendering written at hand-off.
fn render_memory_markdown(
    state: &RalphState,
    plan: &ImplementationPlan,
    summary: Option<&str>,
) -> String {
    let mut lines = vec![
        format!("# Session Memory - Iteration {}", state.iteration_count),
        String::new(),
        "## Completed This Session".to_string(),
    ];

    let mut completed: Vec<_> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Complete && t.completed_at.is_some())
        .collect();
    completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    let recent = &completed[..completed
        .len()
        .min(state.tasks_completed_this_session as usize)];
    if recent.is_empty() {
        lines.push("- No tasks completed this session".to_string());
    } else {
        for task in recent {
            lines.push(format!("- [x] {}", task.description));
        }
    }
    lines.push(String::new());

    lines.push("## Current Task In Progress".to_string());
    let in_progress: Vec<_> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .collect();
    if let Some(task) = in_progress.first() {
        lines.push(format!("Task ID: {}", task.id));
        lines.push(format!("Description: {}", task.description));
    } else if let Some(next) = crate::scheduler::next_task(plan) {
        lines.push(format!("Next up: {} (ID: {})", next.description, next.id));
    } else {
        lines.push("No task in progress".to_string());
    }
    lines.push(String::new());

    lines.push("## Architectural Decisions".to_string());
    if state.architectural_decisions.is_empty() {
        lines.push("- No new decisions this session".to_string());
    } else {
        for decision in &state.architectural_decisions {
            lines.push(format!("- {}", decision));
        }
    }
    lines.push(String::new());

    lines.push("## Files Modified".to_string());
    if state.files_modified.is_empty() {
        lines.push("- No files tracked this session".to_string());
    } else {
        for (i, file) in state
            .files_modified
            .iter()
            .take(MAX_FILES_IN_MEMORY)
            .enumerate()
        {
            lines.push(format!("{}. {}", i + 1, file));
        }
        if state.files_modified.len() > MAX_FILES_IN_MEMORY {
            lines.push(format!(
                "...and {} more",
                state.files_modified.len() - MAX_FILES_IN_MEMORY
            ));
        }
    }
    lines.push(String::new());

    lines.push("## Blockers/Issues".to_string());
    let blocked: Vec<_> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    if blocked.is_empty() {
        lines.push("- No blockers identified".to_string());
    } else {
        for task in blocked {
            lines.push(format!(
                "- {}: {}",
                task.description,
                task.blockers.last().map(|s| s.as_str()).unwrap_or("unknown")
            ));
        }
    }
    lines.push(String::new());

    lines.push("## Notes for Next Session".to_string());
    if state.notes_for_next.is_empty() && summary.is_none() {
        lines.push("- Continue from current task".to_string());
    } else {
        for note in &state.notes_for_next {
            lines.push(format!("- {}", note));
        }
        if let Some(summary) = summary {
            lines.push(format!("- {}", summary));
        }
    }
    lines.push(String::new());

    lines.push("## Session Metadata".to_string());
    lines.push(format!("- Phase: {}", state.current_phase));
    lines.push(format!("- Iteration: {}", state.iteration_count));
    lines.push(format!("- Session Cost: ${:.4}", state.session_cost_usd));
    lines.push(format!("- Session Tokens: {}", state.session_tokens_used));
    lines.push(format!(
        "- Total Progress: {:.0}%",
        plan.completion_percentage() * 100.0
    ));
    lines.push(String::new());

    lines.join("\n")
}
