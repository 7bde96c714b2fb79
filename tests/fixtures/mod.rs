//! Shared test fixtures: temp project setup and a scripted executor.

#![allow(dead_code)]

pub mod mock_executor;
pub mod project;

pub use mock_executor::{ScriptedExecutor, Step};
pub use project::TestProject;
