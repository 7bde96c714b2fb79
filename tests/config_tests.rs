use tempfile::TempDir;

use ralph::config::{RalphConfig, DEFAULT_MODEL, PLANNING_MODEL};

#[tokio::test]
async fn test_defaults_when_no_config_file() {
    let dir = TempDir::new().unwrap();
    let config = RalphConfig::load(dir.path()).await.unwrap();

    assert_eq!(config.max_iterations, 100);
    assert_eq!(config.circuit_breaker_failures, 3);
    assert_eq!(config.circuit_breaker_stagnation, 5);
    assert_eq!(config.cost_limits.per_iteration, 2.0);
    assert_eq!(config.cost_limits.per_session, 50.0);
    assert_eq!(config.cost_limits.total, 200.0);
    assert_eq!(config.context.max_active_memory_chars, 8000);
    assert_eq!(config.context.max_iteration_files, 20);
    assert_eq!(config.context.max_session_files, 10);
    assert_eq!(config.context.archive_retention_days, 30);
    assert_eq!(config.primary_model, DEFAULT_MODEL);
    assert_eq!(config.planning_model, PLANNING_MODEL);
    assert!(config.safety.git_read_only);
    assert!(config.phases.validation.require_human_approval);
}

#[tokio::test]
async fn test_partial_yaml_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    tokio::fs::create_dir_all(dir.path().join(".ralph"))
        .await
        .unwrap();
    tokio::fs::write(
        dir.path().join(".ralph/config.yaml"),
        r#"
max_iterations: 25
cost_limits:
  per_iteration: 1.0
safety:
  blocked_commands:
    - "curl | bash"
phases:
  building:
    max_turns: 40
    allowed_tools: ["Read", "Edit", "Bash"]
"#,
    )
    .await
    .unwrap();

    let config = RalphConfig::load(dir.path()).await.unwrap();
    assert_eq!(config.max_iterations, 25);
    assert_eq!(config.cost_limits.per_iteration, 1.0);
    // Untouched sections keep their defaults.
    assert_eq!(config.cost_limits.per_session, 50.0);
    assert_eq!(
        config.safety.blocked_commands,
        vec!["curl | bash".to_string()]
    );
    assert_eq!(config.phases.building.max_turns, Some(40));
    assert_eq!(
        config.phases.building.allowed_tools,
        Some(vec![
            "Read".to_string(),
            "Edit".to_string(),
            "Bash".to_string()
        ])
    );
}

#[tokio::test]
async fn test_invalid_yaml_is_config_error() {
    let dir = TempDir::new().unwrap();
    tokio::fs::create_dir_all(dir.path().join(".ralph"))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join(".ralph/config.yaml"), "max_iterations: [nope")
        .await
        .unwrap();

    assert!(RalphConfig::load(dir.path()).await.is_err());
}

#[tokio::test]
async fn test_write_default_does_not_overwrite() {
    let dir = TempDir::new().unwrap();
    tokio::fs::create_dir_all(dir.path().join(".ralph"))
        .await
        .unwrap();

    let path = RalphConfig::write_default(dir.path(), "demo").await.unwrap();
    let original = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(original.contains("demo"));

    // A second write leaves the user's file alone.
    tokio::fs::write(&path, "max_iterations: 7\n").await.unwrap();
    RalphConfig::write_default(dir.path(), "other").await.unwrap();
    let kept = tokio::fs::read_to_string(&path).await.unwrap();
    assert_eq!(kept, "max_iterations: 7\n");
}
