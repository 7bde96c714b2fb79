use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ralph::cli::{exit_code_for, exit_codes, Cli, Commands, Display, MemoryAction, PhaseArg};
use ralph::config::{MemoryLimits, RalphConfig};
use ralph::error::{RalphError, Result};
use ralph::executor::{Executor, IterationRequest, IterationResult};
use ralph::memory::MemoryManager;
use ralph::model::{Injection, InjectionSource, Phase, RalphState, TaskStatus};
use ralph::runner::{LoopRunner, RunOptions};
use ralph::store::Store;
use ralph::tools::{ToolCall, ToolDispatcher};

/// Placeholder transport. The LLM transport is supplied by the embedding
/// application; this binary can manage state, plans, injections, and
/// hand-offs without one, but cannot drive iterations.
struct NoTransport;

#[async_trait]
impl Executor for NoTransport {
    async fn run_iteration(&self, _request: IterationRequest<'_>) -> Result<IterationResult> {
        Err(RalphError::Executor(
            "no LLM transport configured; embed ralph as a library and supply an Executor"
                .to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

fn exit_code_for_error(error: &RalphError) -> u8 {
    match error {
        RalphError::NotInitialized | RalphError::StateNotFound(_) => exit_codes::NOT_INITIALIZED,
        RalphError::AlreadyInitialized => exit_codes::BAD_USAGE,
        _ => exit_codes::GENERAL_ERROR,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "ralph=debug" } else { "ralph=info" };
    let filter = std::env::var("RALPH_LOG_LEVEL")
        .map(|level| EnvFilter::new(format!("ralph={}", level)))
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

fn resolve_root(cli_root: &Option<PathBuf>) -> Result<PathBuf> {
    match cli_root {
        Some(root) => Ok(root.clone()),
        None => Ok(std::env::current_dir()?),
    }
}

fn ensure_initialized(store: &Store) -> Result<()> {
    if !store.state_exists() {
        return Err(RalphError::NotInitialized);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<u8> {
    let display = Display::new();
    let root = resolve_root(&cli.project_root)?;
    let store = Store::new(&root);

    match cli.command {
        Commands::Init { force } => cmd_init(&display, &store, &root, force).await,
        Commands::Run {
            phase,
            max_iterations,
        } => cmd_run(&display, &store, &root, phase, max_iterations, false).await,
        Commands::Discover => {
            cmd_run(&display, &store, &root, Some(PhaseArg::Discovery), None, true).await
        }
        Commands::Plan => {
            cmd_run(&display, &store, &root, Some(PhaseArg::Planning), None, true).await
        }
        Commands::Build => {
            cmd_run(&display, &store, &root, Some(PhaseArg::Building), None, true).await
        }
        Commands::Validate => {
            cmd_run(&display, &store, &root, Some(PhaseArg::Validation), None, true).await
        }
        Commands::Status { verbose } => cmd_status(&display, &store, verbose).await,
        Commands::Tasks { pending, all } => cmd_tasks(&display, &store, pending, all).await,
        Commands::History { limit } => cmd_history(&display, &store, limit).await,
        Commands::Pause => cmd_pause(&display, &store, true).await,
        Commands::Resume => cmd_pause(&display, &store, false).await,
        Commands::Skip { task_id, reason } => cmd_skip(&display, &store, &task_id, &reason).await,
        Commands::Inject { message, priority } => {
            cmd_inject(&display, &store, &message, priority).await
        }
        Commands::Handoff { reason, summary } => {
            cmd_handoff(&display, &store, &root, &reason, summary.as_deref()).await
        }
        Commands::RegeneratePlan { discard_completed } => {
            cmd_regenerate_plan(&display, &store, discard_completed).await
        }
        Commands::Reset { keep_plan } => cmd_reset(&display, &store, &root, keep_plan).await,
        Commands::Clean {
            memory,
            force,
            dry_run,
        } => cmd_clean(&display, &store, &root, memory, force, dry_run).await,
        Commands::Memory { action } => cmd_memory(&display, &store, &root, action).await,
    }
}

async fn cmd_init(display: &Display, store: &Store, root: &PathBuf, force: bool) -> Result<u8> {
    if store.state_exists() && !force {
        return Err(RalphError::AlreadyInitialized);
    }

    store.ensure_ralph_dir().await?;
    store.initialize_state().await?;
    store.initialize_plan().await?;
    let config_path = RalphConfig::write_default(root, root_name(root)).await?;

    display.print_success("Initialized ralph.");
    display.print_info(&format!("Configuration: {}", config_path.display()));
    display.print_info(&format!(
        "State: {}",
        store.paths().state_file.display()
    ));
    Ok(exit_codes::OK)
}

fn root_name(root: &PathBuf) -> &str {
    root.file_name().and_then(|n| n.to_str()).unwrap_or("project")
}

async fn cmd_run(
    display: &Display,
    store: &Store,
    root: &PathBuf,
    phase: Option<PhaseArg>,
    max_iterations: Option<u32>,
    single_phase: bool,
) -> Result<u8> {
    ensure_initialized(store)?;
    let config = RalphConfig::load(root).await?;

    if let Some(phase_arg) = phase {
        let target: Phase = phase_arg.into();
        let mut state = store.load_state().await?;
        if state.current_phase != target {
            // Explicit operator phase selection is a forced transition.
            state.advance_phase(target);
            store.save_state(&state).await?;
            display.print_info(&format!("Phase set to {}", target));
        }
        if target == Phase::Validation {
            run_validation_checks(display, store, root, &config).await?;
        }
    }

    let runner = LoopRunner::new(store.clone(), config, Arc::new(NoTransport));
    let spinner = display.create_spinner("Running iteration loop...");
    let result = runner
        .run(RunOptions {
            max_iterations,
            single_phase,
            handle_signals: true,
        })
        .await;
    spinner.finish_and_clear();

    let result = result?;
    display.print_run_summary(&result);

    if result.halt_reason.is_some() {
        let plan = store.load_plan().await?;
        let last_task = ralph::scheduler::next_task(&plan);
        display.print_halt_panel(&result, last_task);
    }

    Ok(exit_code_for(&result))
}

/// Run the configured backpressure commands ahead of a validation loop,
/// queueing failures as a test-failure injection for the next iteration.
async fn run_validation_checks(
    display: &Display,
    store: &Store,
    root: &PathBuf,
    config: &RalphConfig,
) -> Result<()> {
    let spinner = display.create_spinner("Running verification commands...");
    let report = ralph::verify::run_backpressure(&config.build, root).await?;
    spinner.finish_and_clear();

    if report.passed {
        display.print_success(&report.summary);
        return Ok(());
    }

    display.print_warning(&report.summary);
    let mut detail = Vec::new();
    for check in report.failed_checks() {
        display.print_info(&format!("failed: {}", check.command));
        let excerpt: Vec<&str> = check.output.lines().take(5).collect();
        detail.push(format!("`{}`: {}", check.command, excerpt.join(" | ")));
    }
    store
        .add_injection(&Injection::new(
            format!("Verification failures to address:\n{}", detail.join("\n")),
            InjectionSource::TestFailure,
            5,
        ))
        .await?;
    Ok(())
}

async fn cmd_status(display: &Display, store: &Store, verbose: bool) -> Result<u8> {
    ensure_initialized(store)?;
    let state = store.load_state().await?;
    let plan = store.load_plan().await?;
    display.print_status(&state, &plan, verbose);
    Ok(exit_codes::OK)
}

async fn cmd_tasks(display: &Display, store: &Store, pending: bool, all: bool) -> Result<u8> {
    ensure_initialized(store)?;
    let plan = store.load_plan().await?;

    let tasks: Vec<_> = plan
        .tasks
        .iter()
        .filter(|t| {
            if pending {
                t.status == TaskStatus::Pending
            } else if all {
                true
            } else {
                t.status != TaskStatus::Complete
            }
        })
        .collect();
    display.print_tasks(&tasks);
    Ok(exit_codes::OK)
}

async fn cmd_history(display: &Display, store: &Store, limit: usize) -> Result<u8> {
    ensure_initialized(store)?;
    let sessions = store.load_session_archive(limit).await?;
    display.print_history(&sessions);
    Ok(exit_codes::OK)
}

async fn cmd_pause(display: &Display, store: &Store, paused: bool) -> Result<u8> {
    ensure_initialized(store)?;
    let mut state = store.load_state().await?;
    state.paused = paused;
    if !paused {
        // Resuming lets the breaker try a half-open iteration.
        state.circuit_breaker.resume();
    }
    store.save_state(&state).await?;
    display.print_success(if paused { "Paused." } else { "Resumed." });
    Ok(exit_codes::OK)
}

async fn cmd_skip(display: &Display, store: &Store, task_id: &str, reason: &str) -> Result<u8> {
    ensure_initialized(store)?;
    let dispatcher = ToolDispatcher::new(store.clone());
    let outcome = dispatcher
        .dispatch(ToolCall::MarkTaskBlocked {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        })
        .await;

    if outcome.success {
        display.print_success(&outcome.content);
        Ok(exit_codes::OK)
    } else {
        display.print_error(&outcome.error.unwrap_or(outcome.content));
        Ok(exit_codes::GENERAL_ERROR)
    }
}

async fn cmd_inject(display: &Display, store: &Store, message: &str, priority: i64) -> Result<u8> {
    ensure_initialized(store)?;
    store
        .add_injection(&Injection::new(message, InjectionSource::User, priority))
        .await?;
    display.print_success("Injection queued for the next iteration.");
    Ok(exit_codes::OK)
}

async fn cmd_handoff(
    display: &Display,
    store: &Store,
    root: &PathBuf,
    reason: &str,
    summary: Option<&str>,
) -> Result<u8> {
    ensure_initialized(store)?;
    let config = RalphConfig::load(root).await?;
    let runner = LoopRunner::new(store.clone(), config, Arc::new(NoTransport));
    let next_id = runner.execute_handoff_with_summary(reason, summary).await?;
    display.print_success(&format!("Hand-off complete. New session: {}", next_id));
    Ok(exit_codes::OK)
}

async fn cmd_regenerate_plan(
    display: &Display,
    store: &Store,
    discard_completed: bool,
) -> Result<u8> {
    ensure_initialized(store)?;

    let mut plan = store.load_plan().await?;
    plan.clear_tasks(!discard_completed);
    store.save_plan(&plan).await?;

    let mut state = store.load_state().await?;
    state.advance_phase(Phase::Planning);
    state.completion_signals.clear();
    store.save_state(&state).await?;

    display.print_success(&format!(
        "Plan cleared ({} task(s) kept). Returning to planning.",
        plan.tasks.len()
    ));
    Ok(exit_codes::OK)
}

async fn cmd_reset(display: &Display, store: &Store, root: &PathBuf, keep_plan: bool) -> Result<u8> {
    ensure_initialized(store)?;

    let state = RalphState::new(root);
    store.save_state(&state).await?;
    if !keep_plan {
        store.initialize_plan().await?;
    }

    display.print_success(if keep_plan {
        "State reset; plan preserved."
    } else {
        "State and plan reset."
    });
    Ok(exit_codes::OK)
}

async fn cmd_clean(
    display: &Display,
    store: &Store,
    root: &PathBuf,
    memory: bool,
    force: bool,
    dry_run: bool,
) -> Result<u8> {
    let paths = store.paths();
    let mut targets = vec![
        paths.state_file.clone(),
        paths.plan_file.clone(),
        paths.injections_file.clone(),
        paths.progress_file.clone(),
    ];
    if memory {
        targets.push(paths.memory_file.clone());
        targets.push(paths.memory_dir.clone());
        targets.push(paths.session_history_dir.clone());
    }

    let existing: Vec<_> = targets.into_iter().filter(|p| p.exists()).collect();
    if existing.is_empty() {
        display.print_info("Nothing to clean.");
        return Ok(exit_codes::OK);
    }

    if dry_run {
        display.print_header("Clean (dry run)");
        for path in &existing {
            display.print_info(&format!("would delete {}", path.display()));
        }
        return Ok(exit_codes::OK);
    }

    if !force {
        display.print_warning("Refusing to delete state without --force. Use --dry-run to preview.");
        return Ok(exit_codes::BAD_USAGE);
    }

    for path in &existing {
        if path.is_dir() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| RalphError::from_io(e, path))?;
        } else {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| RalphError::from_io(e, path))?;
        }
        display.print_success(&format!("Deleted {}", path.display()));
    }
    display.print_info(&format!(
        "Configuration preserved: {}",
        root.join(".ralph/config.yaml").display()
    ));
    Ok(exit_codes::OK)
}

async fn cmd_memory(
    display: &Display,
    store: &Store,
    root: &PathBuf,
    action: MemoryAction,
) -> Result<u8> {
    ensure_initialized(store)?;
    let config = RalphConfig::load(root).await?;
    let manager = MemoryManager::new(&store.paths().ralph_dir, MemoryLimits::from(&config.context));

    if action.show {
        let state = store.load_state().await?;
        let plan = store.load_plan().await?;
        let memory = manager.build_active_memory(&state, &plan).await;
        println!("{}", memory);
    } else if action.stats {
        display.print_memory_stats(&manager.stats().await);
    } else if action.cleanup {
        let (rotated, deleted) = manager.rotate().await?;
        display.print_success(&format!(
            "Memory rotation complete: {} archived, {} deleted.",
            rotated, deleted
        ));
    }

    Ok(exit_codes::OK)
}
