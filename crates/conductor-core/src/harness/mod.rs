//! Harness adapter interface for LLM coding agents.
//!
//! This module defines the [`Harness`] trait that all agent adapters
//! implement, plus the supporting types ([`AgentHandle`], [`AgentEvent`],
//! [`MaterializedTask`]) and the [`HarnessRegistry`] for runtime lookup.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!     |
//!     v
//! HarnessRegistry --get("claude-code")--> &dyn Harness
//!     |                                        |
//!     |   spawn(task) -------------------------+
//!     |        |
//!     |        v
//!     |   AgentHandle { pid, stdin, task_id, ... }
//!     |        |
//!     |   events(handle) --> Stream<AgentEvent>
//!     |   send(handle, msg)
//!     |   kill(handle)
//!     |   is_running(handle)
//! ```

pub mod claude_code;
pub mod registry;
pub mod trait_def;
pub mod types;

// Re-export the primary public API at the module level.
pub use claude_code::{AgentRunResult, ClaudeCodeAdapter, RunOptions};
pub use registry::HarnessRegistry;
pub use trait_def::Harness;
pub use types::{AgentEvent, AgentHandle, MaterializedTask};

use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;

use claude_code::modified_path;

/// Drain a spawned agent's event stream to completion and fold it into an
/// [`AgentRunResult`], capping the wait at `timeout`.
///
/// Shared by every caller that needs a single completed run rather than a
/// live stream: the Decomposer, Reviewer, Fixer, and Subtask Processor all
/// spawn an agent then call this instead of re-implementing the drain loop.
/// On timeout the handle is killed and a `success: false` result is
/// returned rather than an error, so callers can route the outcome through
/// their own retry/escalation logic uniformly.
pub async fn run_to_completion(
    harness: &dyn Harness,
    handle: &AgentHandle,
    timeout: Duration,
) -> Result<AgentRunResult> {
    let start = Instant::now();
    let mut result = AgentRunResult {
        success: true,
        ..AgentRunResult::default()
    };
    let mut last_message = String::new();

    let drain = async {
        let mut stream = harness.events(handle);
        while let Some(event) = stream.next().await {
            match event {
                AgentEvent::Message { content, .. } => {
                    last_message = content;
                }
                AgentEvent::ToolCall { tool, input } => {
                    if let Some(path) = modified_path(&tool, &input) {
                        if !result.files_modified.contains(&path) {
                            result.files_modified.push(path);
                        }
                    }
                }
                AgentEvent::ToolResult { .. } => {}
                AgentEvent::TokenUsage {
                    input_tokens,
                    output_tokens,
                    cache_creation_tokens,
                    cache_read_tokens,
                } => {
                    result.input_tokens += input_tokens;
                    result.output_tokens += output_tokens;
                    result.cache_creation_tokens += cache_creation_tokens;
                    result.cache_read_tokens += cache_read_tokens;
                }
                AgentEvent::Error { message } => {
                    last_message = message;
                    result.success = false;
                }
                AgentEvent::Completed => break,
            }
        }
    };

    match tokio::time::timeout(timeout, drain).await {
        Ok(()) => {}
        Err(_) => {
            let _ = harness.kill(handle).await;
            result.success = false;
            result.output = last_message;
            result.duration = start.elapsed();
            return Ok(result);
        }
    }

    result.output = last_message;
    result.duration = start.elapsed();
    Ok(result)
}
