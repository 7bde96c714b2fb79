//! Phase-specific prompt assembly.
//!
//! System prompts are rendered from static templates plus a context view;
//! the user prompt carries the current task and any queued injections.
//! Everything here is deterministic string building.

use crate::config::RalphConfig;
use crate::model::{Injection, Phase, Task};

/// Context view handed to the prompt builders for one iteration.
pub struct PromptContext<'a> {
    pub config: &'a RalphConfig,
    pub phase: Phase,
    pub iteration: u64,
    pub task: Option<&'a Task>,
    pub active_memory: &'a str,
    pub injections: &'a [Injection],
    pub remaining_tokens: u64,
    pub usage_percentage: f64,
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = match ctx.phase {
        Phase::Discovery => discovery_prompt(ctx),
        Phase::Planning => planning_prompt(ctx),
        Phase::Building => building_prompt(ctx),
        Phase::Validation => validation_prompt(ctx),
    };

    if !ctx.active_memory.is_empty() {
        prompt.push_str("\n# Memory From Previous Work\n\n");
        prompt.push_str(ctx.active_memory);
        prompt.push('\n');
    }

    prompt
}

pub fn build_user_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    if !ctx.injections.is_empty() {
        prompt.push_str("## Operator Guidance\n\n");
        for injection in ctx.injections {
            prompt.push_str(&format!("- [{}] {}\n", injection.source, injection.content));
        }
        prompt.push('\n');
    }

    match ctx.task {
        Some(task) => {
            let deps = if task.dependencies.is_empty() {
                "None".to_string()
            } else {
                task.dependencies.join(", ")
            };
            let criteria = if task.verification_criteria.is_empty() {
                "  - Implementation complete and tested".to_string()
            } else {
                task.verification_criteria
                    .iter()
                    .map(|c| format!("  - {}", c))
                    .collect::<Vec<_>>()
                    .join("\n")
            };

            prompt.push_str(&format!(
                "Your current task:\n\n\
                 **Task ID:** {id}\n\
                 **Description:** {desc}\n\
                 **Priority:** {priority}\n\
                 **Dependencies:** {deps}\n\
                 **Verification Criteria:**\n{criteria}\n\n\
                 Instructions:\n\
                 1. Call ralph_mark_task_in_progress with task_id=\"{id}\"\n\
                 2. Implement the task\n\
                 3. Run the verification commands before claiming completion\n\
                 4. When complete, call ralph_mark_task_complete with verification notes\n\
                 5. If blocked, call ralph_mark_task_blocked with a clear reason\n\n\
                 Start now.",
                id = task.id,
                desc = task.description,
                priority = task.priority,
                deps = deps,
                criteria = criteria,
            ));
        }
        None => {
            prompt.push_str(&format!(
                "Continue with the {} phase. Use ralph_get_plan_summary and \
                 ralph_get_state_summary to understand current progress.",
                ctx.phase
            ));
        }
    }

    prompt
}

fn header(ctx: &PromptContext<'_>, title: &str) -> String {
    format!(
        "# {title}\n\n\
         You are in the {phase} phase of the Ralph development loop, iteration {iteration}.\n\
         Context usage: {usage:.1}% ({remaining} tokens remaining).\n\n\
         ## Project\n\
         - Name: {name}\n\n",
        title = title,
        phase = ctx.phase,
        iteration = ctx.iteration,
        usage = ctx.usage_percentage,
        remaining = ctx.remaining_tokens,
        name = ctx.config.project.name,
    )
}

fn discovery_prompt(ctx: &PromptContext<'_>) -> String {
    let mut p = header(ctx, "Discovery Phase - Requirements Gathering");
    p.push_str(
        "## Your Mission\n\
         Understand what the user wants to build. Capture:\n\
         - Functional requirements and success criteria\n\
         - Non-functional requirements\n\
         - Constraints and existing code patterns\n\n\
         ## Rules\n\
         - Do NOT write code in this phase\n\
         - Write requirement documents under specs/\n\
         - When requirements are captured, call ralph_signal_phase_complete\n",
    );
    p
}

fn planning_prompt(ctx: &PromptContext<'_>) -> String {
    let mut p = header(ctx, "Planning Phase - Implementation Design");
    p.push_str(
        "## Your Mission\n\
         Create an implementation plan with tasks sized for single context\n\
         windows (~30,000 tokens each).\n\n\
         ## Task Rules\n\
         - Add tasks with ralph_add_task: unique id, description, priority\n\
           (1 = highest), dependencies, verification_criteria\n\
         - Tasks may only depend on previously defined tasks\n\
         - No circular dependencies\n\n\
         ## Rules\n\
         - Do NOT implement, only plan\n\
         - When the plan is complete, call ralph_signal_phase_complete\n",
    );
    p
}

fn building_prompt(ctx: &PromptContext<'_>) -> String {
    let mut p = header(ctx, "Building Phase - Implementation");
    p.push_str(&format!(
        "## Your Mission\n\
         Implement the current task from the implementation plan.\n\n\
         ## Verification Commands\n\
         These MUST pass before marking a task complete:\n{}\n\n\
         ## Rules\n\
         - Git operations are READ-ONLY (no commit, push, merge)\n\
         - Use only the designated package manager ({})\n\
         - Run tests after every change\n\
         - Keep changes focused on the current task\n\
         - Record learnings with ralph_append_learning\n",
        ctx.config
            .build
            .backpressure
            .iter()
            .map(|c| format!("- `{}`", c))
            .collect::<Vec<_>>()
            .join("\n"),
        ctx.config.build.tool,
    ));
    p
}

fn validation_prompt(ctx: &PromptContext<'_>) -> String {
    let mut p = header(ctx, "Validation Phase - Verification");
    p.push_str(&format!(
        "## Your Mission\n\
         Verify the implementation meets all requirements.\n\n\
         ## Checklist\n\
         1. Tests pass: `{}`\n\
         2. Linting passes: `{}`\n\
         3. Type checking passes: `{}`\n\
         4. Every completed task satisfies its verification criteria\n\n\
         ## Rules\n\
         - Report issues, do not fix them in this phase\n\
         - If issues are found, the loop returns to building\n",
        ctx.config.build.test_command,
        ctx.config.build.lint_command,
        ctx.config.build.typecheck_command,
    ));
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InjectionSource;

    fn ctx<'a>(
        config: &'a RalphConfig,
        phase: Phase,
        task: Option<&'a Task>,
        injections: &'a [Injection],
    ) -> PromptContext<'a> {
        PromptContext {
            config,
            phase,
            iteration: 3,
            task,
            active_memory: "",
            injections,
            remaining_tokens: 150_000,
            usage_percentage: 12.5,
        }
    }

    #[test]
    fn test_system_prompt_names_phase() {
        let config = RalphConfig::default();
        let prompt = build_system_prompt(&ctx(&config, Phase::Building, None, &[]));
        assert!(prompt.contains("building phase"));
        assert!(prompt.contains("READ-ONLY"));
    }

    #[test]
    fn test_user_prompt_with_task() {
        let config = RalphConfig::default();
        let task = Task::new("auth-01", "Implement login", 1);
        let prompt = build_user_prompt(&ctx(&config, Phase::Building, Some(&task), &[]));
        assert!(prompt.contains("**Task ID:** auth-01"));
        assert!(prompt.contains("ralph_mark_task_in_progress"));
    }

    #[test]
    fn test_user_prompt_without_task() {
        let config = RalphConfig::default();
        let prompt = build_user_prompt(&ctx(&config, Phase::Planning, None, &[]));
        assert!(prompt.contains("Continue with the planning phase"));
    }

    #[test]
    fn test_injections_rendered_first() {
        let config = RalphConfig::default();
        let injections = vec![Injection::new(
            "focus on error handling",
            InjectionSource::User,
            1,
        )];
        let prompt = build_user_prompt(&ctx(&config, Phase::Building, None, &injections));
        assert!(prompt.starts_with("## Operator Guidance"));
        assert!(prompt.contains("focus on error handling"));
    }

    #[test]
    fn test_memory_appended_to_system_prompt() {
        let config = RalphConfig::default();
        let mut context = ctx(&config, Phase::Building, None, &[]);
        context.active_memory = "## Task State\n- Total: 2 tasks";
        let prompt = build_system_prompt(&context);
        assert!(prompt.contains("# Memory From Previous Work"));
        assert!(prompt.contains("Total: 2 tasks"));
    }
}
