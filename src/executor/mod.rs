//! Executor port: the contract between the supervisory core and the LLM
//! transport.
//!
//! The core sees the transport as one async call per iteration. Tool
//! invocations stream back through the [`ToolRouter`] callback, which
//! applies safety validation and the tool surface one call at a time.
//! Concrete transports live outside this crate; tests drive the loop with
//! a scripted executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::Result;
use crate::tools::ToolOutcome;

/// A tool invocation proposed by the executor.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
}

/// Routes tool invocations through the safety validator and the tool
/// surface. Injected into the executor so every call is gated.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    async fn route(&self, invocation: ToolInvocation) -> ToolOutcome;
}

/// Cooperative cancellation. The runner holds the [`CancelHandle`]; the
/// token is cloned into the executor call.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. Pends forever if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Everything the transport needs for one iteration.
pub struct IterationRequest<'a> {
    pub system_prompt: String,
    pub user_prompt: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub model: String,
    pub timeout: Duration,
    pub cancel: CancelToken,
    pub router: &'a dyn ToolRouter,
}

/// Result of one executor invocation. Transport errors are surfaced
/// verbatim in `error`; cancellation arrives as `error: "cancelled"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationResult {
    pub success: bool,
    pub task_completed: bool,
    pub task_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub needs_handoff: bool,
    pub error: Option<String>,
    pub tool_calls: u32,
    pub duration_ms: u64,
}

impl IterationResult {
    pub fn tokens_used(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            error: Some("cancelled".to_string()),
            ..Self::default()
        }
    }
}

/// The LLM transport contract. Exactly one call is in flight at a time.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_iteration(&self, request: IterationRequest<'_>) -> Result<IterationResult>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn run_iteration(&self, request: IterationRequest<'_>) -> Result<IterationResult> {
        (**self).run_iteration(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_token_observes_handle() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        // Already-cancelled tokens resolve immediately.
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let (handle, token) = cancel_pair();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            true
        });
        handle.cancel();
        assert!(waiter.await.unwrap());
    }
}
