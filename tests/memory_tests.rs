mod fixtures;

use fixtures::TestProject;

use ralph::config::MemoryLimits;
use ralph::memory::MemoryManager;
use ralph::model::{Phase, SessionNoteKind};

fn limits() -> MemoryLimits {
    MemoryLimits {
        max_active_memory_chars: 8000,
        max_iteration_files: 20,
        max_session_files: 10,
        archive_retention_days: 30,
    }
}

fn manager(project: &TestProject) -> MemoryManager {
    MemoryManager::new(&project.store.paths().ralph_dir, limits())
}

#[tokio::test]
async fn test_iteration_memory_file_naming() {
    let project = TestProject::new().await.with_tasks(&[("A", 1, &[])]).await;
    let manager = manager(&project);

    let mut state = project.store.load_state().await.unwrap();
    for _ in 0..3 {
        state.start_iteration();
    }
    let plan = project.store.load_plan().await.unwrap();

    let path = manager
        .capture_iteration(&state, &plan, true, 5000, 0.05, None)
        .await
        .unwrap();
    assert!(path.ends_with("iter-003.md"));

    let content = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(content.starts_with("## Iteration 3"));
}

#[tokio::test]
async fn test_phase_memory_overwrites() {
    let project = TestProject::new().await;
    let manager = manager(&project);
    let state = project.store.load_state().await.unwrap();

    let first = manager
        .capture_phase_transition(&state, Phase::Discovery, Default::default(), "first pass")
        .await
        .unwrap();
    let second = manager
        .capture_phase_transition(&state, Phase::Discovery, Default::default(), "second pass")
        .await
        .unwrap();
    assert_eq!(first, second);

    let content = manager.load_phase_memory(Phase::Discovery).await.unwrap();
    assert!(content.contains("second pass"));
    assert!(!content.contains("first pass"));
}

#[tokio::test]
async fn test_rotation_respects_caps_and_keeps_recent() {
    let project = TestProject::new().await;
    let manager = manager(&project);
    manager.ensure_dirs().await.unwrap();

    let iterations_dir = project.store.paths().memory_subdir("iterations");
    for i in 1..=25 {
        tokio::fs::write(
            iterations_dir.join(format!("iter-{:03}.md", i)),
            format!("## Iteration {}\n", i),
        )
        .await
        .unwrap();
    }

    let sessions_dir = project.store.paths().memory_subdir("sessions");
    for i in 1..=12 {
        tokio::fs::write(
            sessions_dir.join(format!("session-{:03}.md", i)),
            format!("# Session {}\n", i),
        )
        .await
        .unwrap();
    }

    let (rotated, _deleted) = manager.rotate().await.unwrap();
    assert_eq!(rotated, 5 + 2);

    let stats = manager.stats().await;
    assert_eq!(stats.iteration_files, 20);
    assert_eq!(stats.session_files, 10);
    assert_eq!(stats.archive_files, 7);

    // The most recent files survive; the oldest are archived.
    assert!(iterations_dir.join("iter-025.md").exists());
    assert!(!iterations_dir.join("iter-001.md").exists());
    assert!(project
        .store
        .paths()
        .memory_subdir("archive")
        .join("iter-001.md")
        .exists());
}

#[tokio::test]
async fn test_rotation_is_idempotent_under_cap() {
    let project = TestProject::new().await;
    let manager = manager(&project);
    manager.ensure_dirs().await.unwrap();

    let (rotated, deleted) = manager.rotate().await.unwrap();
    assert_eq!((rotated, deleted), (0, 0));
}

#[tokio::test]
async fn test_active_memory_sections_and_cap() {
    let project = TestProject::new()
        .await
        .with_tasks(&[("A", 1, &[]), ("B", 2, &["A"])])
        .await;
    let small_limits = MemoryLimits {
        max_active_memory_chars: 300,
        ..limits()
    };
    let manager = MemoryManager::new(&project.store.paths().ralph_dir, small_limits);

    let mut state = project.store.load_state().await.unwrap();
    state.current_phase = Phase::Building;
    let plan = project.store.load_plan().await.unwrap();

    // A long previous-phase memory forces truncation.
    manager
        .capture_phase_transition(
            &state,
            Phase::Planning,
            Default::default(),
            "x".repeat(4000),
        )
        .await
        .unwrap();

    let memory = manager.build_active_memory(&state, &plan).await;
    assert!(memory.len() <= 300);
    assert!(memory.ends_with("...(truncated)"));
    assert!(memory.contains("## From Planning Phase"));
}

#[tokio::test]
async fn test_active_memory_includes_task_state_and_metrics() {
    let project = TestProject::new()
        .await
        .with_tasks(&[("A", 1, &[]), ("B", 2, &["A"])])
        .await;
    let manager = manager(&project);

    let mut plan = project.store.load_plan().await.unwrap();
    plan.mark_task_complete("A", None, None).unwrap();
    let state = project.store.load_state().await.unwrap();

    let memory = manager.build_active_memory(&state, &plan).await;
    assert!(memory.contains("## Task State"));
    assert!(memory.contains("- Total: 2 tasks"));
    assert!(memory.contains("## Session Metrics"));
}

#[tokio::test]
async fn test_memory_file_rendering() {
    let project = TestProject::new()
        .await
        .with_tasks(&[("A", 1, &[]), ("B", 2, &[])])
        .await;
    let manager = manager(&project);

    let mut plan = project.store.load_plan().await.unwrap();
    plan.mark_task_complete("A", None, None).unwrap();
    plan.mark_task_blocked("B", "flaky dependency").unwrap();
    let mut state = project.store.load_state().await.unwrap();
    state.tasks_completed_this_session = 1;
    state.record_session_note(
        SessionNoteKind::ArchitecturalDecision,
        "atomic rename for every state write",
    );
    state.record_session_note(SessionNoteKind::FileModified, "src/store/mod.rs");
    state.record_session_note(SessionNoteKind::NoteForNext, "pick up task B first");

    let path = manager
        .write_memory_file(&state, &plan, Some("good session"))
        .await
        .unwrap();
    let content = tokio::fs::read_to_string(&path).await.unwrap();

    assert!(content.contains("## Completed This Session"));
    assert!(content.contains("- [x] task A"));
    assert!(content.contains("## Architectural Decisions"));
    assert!(content.contains("- atomic rename for every state write"));
    assert!(content.contains("## Files Modified"));
    assert!(content.contains("1. src/store/mod.rs"));
    assert!(content.contains("## Blockers/Issues"));
    assert!(content.contains("flaky dependency"));
    assert!(content.contains("## Notes for Next Session"));
    assert!(content.contains("- pick up task B first"));
    assert!(content.contains("- good session"));
    assert!(content.contains("## Session Metadata"));
}

#[tokio::test]
async fn test_memory_file_defaults_without_notes() {
    let project = TestProject::new().await;
    let manager = manager(&project);

    let state = project.store.load_state().await.unwrap();
    let plan = project.store.load_plan().await.unwrap();

    let path = manager.write_memory_file(&state, &plan, None).await.unwrap();
    let content = tokio::fs::read_to_string(&path).await.unwrap();

    assert!(content.contains("- No new decisions this session"));
    assert!(content.contains("- No files tracked this session"));
    assert!(content.contains("- Continue from current task"));
}

#[tokio::test]
async fn test_apply_memory_update_modes() {
    let project = TestProject::new().await;
    let manager = manager(&project);

    manager.apply_memory_update("base", false).await.unwrap();
    manager.apply_memory_update("more", true).await.unwrap();
    let content = tokio::fs::read_to_string(&project.store.paths().memory_file)
        .await
        .unwrap();
    assert_eq!(content, "base\nmore");

    manager.apply_memory_update("fresh", false).await.unwrap();
    let content = tokio::fs::read_to_string(&project.store.paths().memory_file)
        .await
        .unwrap();
    assert_eq!(content, "fresh");
}

#[tokio::test]
async fn test_session_memory_sequential_numbering() {
    let project = TestProject::new().await;
    let manager = manager(&project);
    let state = project.store.load_state().await.unwrap();
    let plan = project.store.load_plan().await.unwrap();

    let first = manager
        .capture_session_handoff(&state, &plan, "context_budget")
        .await
        .unwrap();
    let second = manager
        .capture_session_handoff(&state, &plan, "operator_requested")
        .await
        .unwrap();

    assert!(first.ends_with("session-001.md"));
    assert!(second.ends_with("session-002.md"));
}
