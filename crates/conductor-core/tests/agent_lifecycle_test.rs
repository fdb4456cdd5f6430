//! Integration tests for `run_to_completion`, the shared drain loop used by
//! the Decomposer, Reviewer, Fixer, and Subtask Processor to turn a live
//! agent event stream into a single completed run result.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use conductor_core::harness::{
    run_to_completion, AgentEvent, AgentHandle, Harness, MaterializedTask,
};

/// A harness whose event stream is a fixed, pre-scripted sequence.
struct MockHarness {
    events: Vec<AgentEvent>,
}

fn handle(task_id: Uuid) -> AgentHandle {
    AgentHandle {
        pid: 1,
        stdin: None,
        task_id,
        attempt: 0,
        harness_name: "mock".to_string(),
    }
}

fn materialized_task(task_id: Uuid) -> MaterializedTask {
    MaterializedTask {
        task_id,
        name: "do the thing".to_string(),
        description: "a test task".to_string(),
        invariant_commands: vec![],
        working_dir: std::env::temp_dir(),
        env_vars: Default::default(),
    }
}

#[async_trait]
impl Harness for MockHarness {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(&self, task: &MaterializedTask) -> Result<AgentHandle> {
        Ok(handle(task.task_id))
    }

    fn events(&self, _handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        Box::pin(futures::stream::iter(self.events.clone()))
    }

    async fn send(&self, _handle: &AgentHandle, _message: &str) -> Result<()> {
        Ok(())
    }

    async fn kill(&self, _handle: &AgentHandle) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self, _handle: &AgentHandle) -> bool {
        false
    }
}

#[tokio::test]
async fn drains_messages_and_tool_calls_into_a_result() {
    let task_id = Uuid::new_v4();
    let harness = MockHarness {
        events: vec![
            AgentEvent::Message {
                role: "assistant".to_string(),
                content: "working on it".to_string(),
            },
            AgentEvent::ToolCall {
                tool: "Write".to_string(),
                input: serde_json::json!({"file_path": "src/lib.rs"}),
            },
            AgentEvent::ToolCall {
                tool: "Read".to_string(),
                input: serde_json::json!({"file_path": "src/main.rs"}),
            },
            AgentEvent::TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_creation_tokens: 0,
                cache_read_tokens: 10,
            },
            AgentEvent::Message {
                role: "assistant".to_string(),
                content: "done".to_string(),
            },
            AgentEvent::Completed,
        ],
    };

    let task = materialized_task(task_id);
    let h = harness.spawn(&task).await.unwrap();
    let result = run_to_completion(&harness, &h, Duration::from_secs(5)).await.unwrap();

    assert!(result.success);
    assert_eq!(result.output, "done");
    assert_eq!(result.files_modified, vec!["src/lib.rs".to_string()]);
    assert_eq!(result.input_tokens, 100);
    assert_eq!(result.output_tokens, 50);
    assert_eq!(result.cache_read_tokens, 10);
}

#[tokio::test]
async fn duplicate_writes_to_the_same_file_are_not_double_counted() {
    let task_id = Uuid::new_v4();
    let harness = MockHarness {
        events: vec![
            AgentEvent::ToolCall {
                tool: "Edit".to_string(),
                input: serde_json::json!({"file_path": "src/lib.rs"}),
            },
            AgentEvent::ToolCall {
                tool: "Edit".to_string(),
                input: serde_json::json!({"file_path": "src/lib.rs"}),
            },
            AgentEvent::Completed,
        ],
    };

    let task = materialized_task(task_id);
    let h = harness.spawn(&task).await.unwrap();
    let result = run_to_completion(&harness, &h, Duration::from_secs(5)).await.unwrap();

    assert_eq!(result.files_modified, vec!["src/lib.rs".to_string()]);
}

#[tokio::test]
async fn error_event_marks_the_run_as_unsuccessful() {
    let task_id = Uuid::new_v4();
    let harness = MockHarness {
        events: vec![
            AgentEvent::Message {
                role: "assistant".to_string(),
                content: "trying".to_string(),
            },
            AgentEvent::Error {
                message: "agent process crashed".to_string(),
            },
            AgentEvent::Completed,
        ],
    };

    let task = materialized_task(task_id);
    let h = harness.spawn(&task).await.unwrap();
    let result = run_to_completion(&harness, &h, Duration::from_secs(5)).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.output, "agent process crashed");
}

#[tokio::test]
async fn a_stream_that_never_completes_is_cut_off_by_the_timeout() {
    let task_id = Uuid::new_v4();
    // No `Completed` event: the stream stays pending forever, so the only
    // way out is the timeout branch.
    struct HangingHarness;

    #[async_trait]
    impl Harness for HangingHarness {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn spawn(&self, task: &MaterializedTask) -> Result<AgentHandle> {
            Ok(handle(task.task_id))
        }

        fn events(&self, _handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
            Box::pin(futures::stream::pending())
        }

        async fn send(&self, _handle: &AgentHandle, _message: &str) -> Result<()> {
            Ok(())
        }

        async fn kill(&self, _handle: &AgentHandle) -> Result<()> {
            Ok(())
        }

        async fn is_running(&self, _handle: &AgentHandle) -> bool {
            true
        }
    }

    let harness = HangingHarness;
    let task = materialized_task(task_id);
    let h = harness.spawn(&task).await.unwrap();
    let result = run_to_completion(&harness, &h, Duration::from_millis(50)).await.unwrap();

    assert!(!result.success, "a timed-out run must not report success");
}
