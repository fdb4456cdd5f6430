//! Shared types exchanged between the [`super::Harness`] trait and its
//! callers.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::process::ChildStdin;
use uuid::Uuid;

/// A handle to a spawned agent process.
pub struct AgentHandle {
    pub pid: u32,
    pub stdin: Option<ChildStdin>,
    pub task_id: Uuid,
    pub attempt: i32,
    pub harness_name: String,
}

/// A subtask flattened into everything a harness needs to run an agent
/// against it, with no database dependency.
#[derive(Debug, Clone)]
pub struct MaterializedTask {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    /// Project test/lint/typecheck commands surfaced to the agent so it can
    /// self-check before finishing; empty when none are configured.
    pub invariant_commands: Vec<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}

/// One event in an agent's execution stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A chat-style message emitted by the model.
    Message { role: String, content: String },
    /// The model invoked a tool.
    ToolCall { tool: String, input: serde_json::Value },
    /// A tool call's result was returned to the model.
    ToolResult { tool: String, output: String },
    /// Incremental token usage for this turn.
    TokenUsage {
        input_tokens: i64,
        output_tokens: i64,
        cache_creation_tokens: i64,
        cache_read_tokens: i64,
    },
    /// The harness or the underlying process reported an error.
    Error { message: String },
    /// The agent process exited; no further events will be produced.
    Completed,
}
