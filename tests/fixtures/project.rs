//! Temporary initialized project fixtures.

use tempfile::TempDir;

use ralph::model::{Phase, Task};
use ralph::store::Store;

/// An initialized `.ralph/` project in a temp directory.
pub struct TestProject {
    pub root: TempDir,
    pub store: Store,
}

impl TestProject {
    pub async fn new() -> Self {
        let root = TempDir::new().expect("temp dir");
        let store = Store::new(root.path());
        store.ensure_ralph_dir().await.expect("ralph dir");
        store.initialize_state().await.expect("init state");
        store.initialize_plan().await.expect("init plan");
        Self { root, store }
    }

    /// Initialized project already in the given phase.
    pub async fn in_phase(phase: Phase) -> Self {
        let project = Self::new().await;
        let mut state = project.store.load_state().await.unwrap();
        state.current_phase = phase;
        project.store.save_state(&state).await.unwrap();
        project
    }

    /// Add `(id, priority, deps)` tasks to the plan.
    pub async fn with_tasks(self, tasks: &[(&str, i64, &[&str])]) -> Self {
        let mut plan = self.store.load_plan().await.unwrap();
        for (id, priority, deps) in tasks {
            let task = Task::new(*id, format!("task {}", id), *priority)
                .with_dependencies(deps.iter().map(|d| d.to_string()).collect());
            plan.add_task(task).unwrap();
        }
        self.store.save_plan(&plan).await.unwrap();
        self
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }
}
