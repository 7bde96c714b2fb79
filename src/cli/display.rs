use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::memory::MemoryStats;
use crate::model::{
    CircuitState, ImplementationPlan, RalphState, SessionArchive, Task, TaskStatus,
};
use crate::runner::LoopResult;

pub struct Display;

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_success(&self, text: &str) {
        println!("{} {}", style("✓").green().bold(), text);
    }

    pub fn print_error(&self, text: &str) {
        eprintln!("{} {}", style("✗").red().bold(), text);
    }

    pub fn print_warning(&self, text: &str) {
        println!("{} {}", style("!").yellow().bold(), text);
    }

    pub fn print_info(&self, text: &str) {
        println!("{} {}", style("·").dim(), text);
    }

    pub fn create_spinner(&self, message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner());
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner
    }

    pub fn print_status(&self, state: &RalphState, plan: &ImplementationPlan, verbose: bool) {
        self.print_header("Ralph Status");

        println!("Phase:       {}", style(state.current_phase).bold());
        println!("Iteration:   {}", state.iteration_count);
        if let Some(session) = &state.session_id {
            println!("Session:     {}", session);
        }
        println!(
            "Paused:      {}",
            if state.paused {
                style("yes").yellow()
            } else {
                style("no").dim()
            }
        );
        println!();

        println!(
            "Tasks:       {}/{} complete ({:.0}%)",
            plan.complete_count(),
            plan.tasks.len(),
            plan.completion_percentage() * 100.0
        );
        println!(
            "             {} pending, {} blocked, {} in progress",
            plan.pending_count(),
            plan.blocked_count(),
            plan.in_progress_count()
        );
        println!();

        println!(
            "Cost:        ${:.4} total, ${:.4} this session",
            state.total_cost_usd, state.session_cost_usd
        );
        println!(
            "Tokens:      {} total, {} this session",
            state.total_tokens_used, state.session_tokens_used
        );
        println!(
            "Context:     {:.1}% of window used",
            state.context_budget.usage_percentage()
        );
        println!();

        let cb = &state.circuit_breaker;
        let cb_style = match cb.state {
            CircuitState::Closed => style(cb.state.to_string()).green(),
            CircuitState::Open => style(cb.state.to_string()).red().bold(),
            CircuitState::HalfOpen => style(cb.state.to_string()).yellow(),
        };
        println!(
            "Breaker:     {} (failures {}/{}, stagnation {}/{})",
            cb_style,
            cb.failure_count,
            cb.max_consecutive_failures,
            cb.stagnation_count,
            cb.max_stagnation_iterations
        );
        if let Some(reason) = &cb.last_failure_reason {
            println!("Last fail:   {}", style(reason).dim());
        }

        if verbose {
            println!();
            println!("Started:     {}", state.started_at.format("%Y-%m-%d %H:%M:%S"));
            println!(
                "Last active: {}",
                state.last_activity_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!("Root:        {}", state.project_root.display());
        }
        println!();
    }

    pub fn print_tasks(&self, tasks: &[&Task]) {
        if tasks.is_empty() {
            self.print_info("No tasks to show.");
            return;
        }

        println!(
            "{:<14} {:<4} {:<12} {:<8} DESCRIPTION",
            style("ID").bold(),
            style("PRI").bold(),
            style("STATUS").bold(),
            style("RETRY").bold(),
        );
        for task in tasks {
            let status = match task.status {
                TaskStatus::Pending => style("pending").dim(),
                TaskStatus::InProgress => style("in_progress").yellow(),
                TaskStatus::Complete => style("complete").green(),
                TaskStatus::Blocked => style("blocked").red(),
            };
            println!(
                "{:<14} {:<4} {:<12} {:<8} {}",
                task.id, task.priority, status, task.retry_count, task.description
            );
            if task.status == TaskStatus::Blocked {
                if let Some(reason) = task.blockers.last() {
                    println!("               {}", style(format!("reason: {}", reason)).dim());
                }
            }
        }
        println!();
    }

    pub fn print_history(&self, sessions: &[SessionArchive]) {
        if sessions.is_empty() {
            self.print_info("No session history yet.");
            return;
        }

        self.print_header("Session History");
        for session in sessions {
            println!(
                "{}  {} iter {}  {} tasks  ${:.4}  {}",
                style(&session.session_id).bold(),
                session.phase,
                session.iteration,
                session.tasks_completed,
                session.cost_usd,
                style(&session.handoff_reason).dim(),
            );
        }
        println!();
    }

    pub fn print_memory_stats(&self, stats: &MemoryStats) {
        self.print_header("Memory");
        println!("Iteration files: {}", stats.iteration_files);
        println!("Session files:   {}", stats.session_files);
        println!("Phase files:     {}", stats.phase_files);
        println!("Archived files:  {}", stats.archive_files);
        println!("Total size:      {} bytes", stats.total_size_bytes);
        println!();
    }

    /// The single halt panel: reason, last task, cost, suggested recovery.
    pub fn print_halt_panel(&self, result: &LoopResult, last_task: Option<&Task>) {
        println!();
        println!("{}", style("─".repeat(60)).red());
        println!(
            "{}  {}",
            style("HALTED").red().bold(),
            result.halt_reason.as_deref().unwrap_or("unknown reason")
        );
        if let Some(task) = last_task {
            println!("Last task attempted: {} ({})", task.id, task.description);
        }
        println!(
            "Iterations: {}  Tasks completed: {}  Cost: ${:.4}",
            result.iterations_completed, result.tasks_completed, result.total_cost_usd
        );
        println!();
        println!(
            "Recovery: {}",
            style("ralph skip <task_id> | ralph inject <guidance> | ralph regenerate-plan | ralph reset")
                .dim()
        );
        println!("{}", style("─".repeat(60)).red());
        println!();
    }

    pub fn print_run_summary(&self, result: &LoopResult) {
        println!();
        println!(
            "{} {:?} after {} iteration(s), {} session(s)",
            style("Run finished:").bold(),
            result.status,
            result.iterations_completed,
            result.session_count
        );
        println!(
            "Phase: {}  Tasks completed: {}  Cost: ${:.4}  Tokens: {}",
            result.final_phase,
            result.tasks_completed,
            result.total_cost_usd,
            result.total_tokens_used
        );
        println!();
    }
}
