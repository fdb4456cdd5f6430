//! Claude Code harness adapter.
//!
//! Spawns `claude --print --output-format json --dangerously-skip-permissions`
//! as a subprocess with the prompt as its final positional argument, and
//! parses its JSONL output into [`AgentEvent`] variants.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::trait_def::Harness;
use super::types::{AgentEvent, AgentHandle, MaterializedTask};

/// Output is capped at 1 MiB; a run producing more than this is terminated.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Default wall-clock budget for a single agent run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Grace period after SIGTERM before escalating to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Options controlling a single agent invocation, supplied by the caller
/// (task/subtask processor) per run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

/// Internal state kept per spawned process.
struct ProcessState {
    child: Child,
    stdout: Option<ChildStdout>,
    bytes_read: usize,
    run_options: RunOptions,
}

/// Harness adapter for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
#[derive(Clone)]
pub struct ClaudeCodeAdapter {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    claude_binary_path: String,
    /// Per-process bookkeeping, keyed by OS pid.
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for ClaudeCodeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCodeAdapter")
            .field("claude_binary_path", &self.claude_binary_path)
            .finish()
    }
}

impl ClaudeCodeAdapter {
    /// Create a new adapter that will look for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self {
            claude_binary_path: "claude".to_string(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new adapter with a custom binary path.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            claude_binary_path: path.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn an agent with explicit invocation options, including the
    /// prompt to pass as the final positional argument.
    pub async fn spawn_with_options(
        &self,
        task: &MaterializedTask,
        prompt: &str,
        options: RunOptions,
    ) -> Result<AgentHandle> {
        let mut cmd = Command::new(&self.claude_binary_path);

        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--dangerously-skip-permissions");

        if let Some(model) = &options.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_turns) = options.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        if let Some(system_prompt) = &options.system_prompt {
            cmd.arg("--system-prompt").arg(system_prompt);
        }
        if !options.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(options.allowed_tools.join(","));
        }
        if !options.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools").arg(options.disallowed_tools.join(","));
        }

        // The prompt is the final positional argument.
        cmd.arg(prompt);

        cmd.current_dir(&task.working_dir);
        for (key, value) in &task.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn claude binary at '{}' -- is it installed and on PATH?",
                self.claude_binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;
        let stdout = child.stdout.take();

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                pid,
                ProcessState {
                    child,
                    stdout,
                    bytes_read: 0,
                    run_options: options,
                },
            );
        }

        Ok(AgentHandle {
            pid,
            stdin: None,
            task_id: task.task_id,
            attempt: 0,
            harness_name: self.name().to_string(),
        })
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing helpers
// ---------------------------------------------------------------------------

/// Parse a single JSONL line emitted by Claude Code into zero or more
/// [`AgentEvent`] values.
///
/// Returns `Ok(events)` on success or `Err` if the line is not valid JSON.
/// Callers should treat `Err` as a warning and continue reading.
fn parse_stream_json_line(line: &str) -> Result<Vec<AgentEvent>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;

    let mut events = Vec::new();
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        // The running agent's progress: text content, truncated for display.
        "assistant" => {
            if let Some(message) = v.get("message") {
                if let Some(content_arr) = message.get("content").and_then(|c| c.as_array()) {
                    for block in content_arr {
                        let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
                        match block_type {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                    let truncated: String = text.chars().take(100).collect();
                                    events.push(AgentEvent::Message {
                                        role: "assistant".to_string(),
                                        content: truncated,
                                    });
                                }
                            }
                            "tool_use" => {
                                events.push(tool_call_event(block));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        "tool_use" => {
            events.push(tool_call_event(&v));
        }

        "tool_result" => {
            let tool_name = v
                .get("name")
                .or_else(|| v.get("tool"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string();
            let output = v
                .get("output")
                .or_else(|| v.get("content"))
                .and_then(|o| o.as_str())
                .unwrap_or_default()
                .to_string();
            events.push(AgentEvent::ToolResult {
                tool: tool_name,
                output,
            });
        }

        // Incremental usage delta for the current turn.
        "usage" => {
            events.push(usage_event(&v));
        }

        // Final message: commit total token/cost accounting.
        "result" => {
            if let Some(result_text) = v.get("result").and_then(|r| r.as_str()) {
                let truncated: String = result_text.chars().take(100).collect();
                events.push(AgentEvent::Message {
                    role: "assistant".to_string(),
                    content: truncated,
                });
            }
            if let Some(usage) = v.get("usage") {
                events.push(usage_event(usage));
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            events.push(AgentEvent::Error { message });
        }

        other => {
            debug!(event_type = other, "ignoring unrecognised agent event type");
        }
    }

    Ok(events)
}

fn tool_call_event(block: &serde_json::Value) -> AgentEvent {
    let tool_name = block
        .get("name")
        .or_else(|| block.get("tool"))
        .and_then(|n| n.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
    AgentEvent::ToolCall {
        tool: tool_name,
        input,
    }
}

fn usage_event(usage: &serde_json::Value) -> AgentEvent {
    let input_tokens = usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let output_tokens = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let cache_creation_tokens = usage
        .get("cache_creation_input_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let cache_read_tokens = usage
        .get("cache_read_input_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    AgentEvent::TokenUsage {
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
    }
}

/// Returns a path named by a tool-use/tool-result block, if that block
/// represents a filesystem write. Used by callers assembling
/// `AgentRunResult::files_modified` from a drained event stream.
pub(crate) fn modified_path(tool: &str, input_or_output: &serde_json::Value) -> Option<String> {
    const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit"];
    if !WRITE_TOOLS.contains(&tool) {
        return None;
    }
    input_or_output
        .get("file_path")
        .or_else(|| input_or_output.get("path"))
        .and_then(|p| p.as_str())
        .map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Harness trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Harness for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn spawn(&self, task: &MaterializedTask) -> Result<AgentHandle> {
        let prompt = format!(
            "Task: {name}\n\n{description}\n\nAvailable checks:\n{invariants}",
            name = task.name,
            description = task.description,
            invariants = task
                .invariant_commands
                .iter()
                .map(|c| format!("  - {c}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        self.spawn_with_options(task, &prompt, RunOptions::default()).await
    }

    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available for pid -- events already consumed or process missing");
                yield AgentEvent::Error {
                    message: "stdout not available (already consumed or process not found)".to_string(),
                };
                yield AgentEvent::Completed;
                return;
            };

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }

                        let exceeded_cap = {
                            let mut procs = processes.lock().await;
                            if let Some(state) = procs.get_mut(&pid) {
                                state.bytes_read += trimmed.len();
                                state.bytes_read > MAX_OUTPUT_BYTES
                            } else {
                                false
                            }
                        };
                        if exceeded_cap {
                            warn!(pid, "agent output exceeded cap, terminating run");
                            yield AgentEvent::Error {
                                message: format!("output exceeded {MAX_OUTPUT_BYTES} byte cap"),
                            };
                            break;
                        }

                        match parse_stream_json_line(trimmed) {
                            Ok(events) => {
                                for event in events {
                                    yield event;
                                }
                            }
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        yield AgentEvent::Error {
                            message: format!("stdout read error: {e}"),
                        };
                        break;
                    }
                }
            }

            yield AgentEvent::Completed;
        };

        Box::pin(stream)
    }

    async fn send(&self, handle: &AgentHandle, message: &str) -> Result<()> {
        let _ = handle;
        let _ = message;
        bail!("send() is not supported by ClaudeCodeAdapter -- each run is single-shot")
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid u32 from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            let exited = tokio::time::timeout(KILL_GRACE, state.child.wait()).await;

            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid, "process exited after SIGTERM");
                }
                _ => {
                    debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
                    let _ = state.child.kill().await;
                }
            }

            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but process not in map (already exited?)");
        }

        Ok(())
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            match state.child.try_wait() {
                Ok(Some(_status)) => {
                    processes.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking process status");
                    false
                }
            }
        } else {
            false
        }
    }
}

/// The outcome of a single, completed agent run -- built by a caller
/// (subtask processor) by draining a harness's event stream to completion.
#[derive(Debug, Clone, Default)]
pub struct AgentRunResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub total_cost_usd: Option<f64>,
    pub files_modified: Vec<String>,
    pub duration: Duration,
}
