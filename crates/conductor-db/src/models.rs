use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task -- the human-intent unit tied to one board item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Decomposing,
    Executing,
    Review,
    HumanReview,
    PrCreated,
    Done,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Decomposing => "decomposing",
            Self::Executing => "executing",
            Self::Review => "review",
            Self::HumanReview => "human_review",
            Self::PrCreated => "pr_created",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "decomposing" => Ok(Self::Decomposing),
            "executing" => Ok(Self::Executing),
            "review" => Ok(Self::Review),
            "human_review" => Ok(Self::HumanReview),
            "pr_created" => Ok(Self::PrCreated),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a subtask -- an individual unit of agent work within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = SubtaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SubtaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SubtaskStatusParseError(pub String);

impl fmt::Display for SubtaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask status: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskStatusParseError {}

// ---------------------------------------------------------------------------

/// What kind of invocation an [`AgentRun`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRunType {
    /// The Decomposer, analysing a task and producing a plan.
    Master,
    /// The Subtask Processor, editing code for one subtask.
    SubAgent,
    /// The Reviewer, judging an accumulated diff.
    CodeReview,
}

impl fmt::Display for AgentRunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Master => "master",
            Self::SubAgent => "sub_agent",
            Self::CodeReview => "code_review",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRunType {
    type Err = AgentRunTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Self::Master),
            "sub_agent" => Ok(Self::SubAgent),
            "code_review" => Ok(Self::CodeReview),
            other => Err(AgentRunTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRunType`] string.
#[derive(Debug, Clone)]
pub struct AgentRunTypeParseError(pub String);

impl fmt::Display for AgentRunTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent run type: {:?}", self.0)
    }
}

impl std::error::Error for AgentRunTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRunStatus {
    type Err = AgentRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(AgentRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRunStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentRunStatusParseError(pub String);

impl fmt::Display for AgentRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent run status: {:?}", self.0)
    }
}

impl std::error::Error for AgentRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Outcome recorded by the Reviewer against a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CodeReviewResult {
    Approved,
    ChangesRequested,
    Failed,
}

impl fmt::Display for CodeReviewResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for CodeReviewResult {
    type Err = CodeReviewResultParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            "failed" => Ok(Self::Failed),
            other => Err(CodeReviewResultParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CodeReviewResult`] string.
#[derive(Debug, Clone)]
pub struct CodeReviewResultParseError(pub String);

impl fmt::Display for CodeReviewResultParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid code review result: {:?}", self.0)
    }
}

impl std::error::Error for CodeReviewResultParseError {}

// ---------------------------------------------------------------------------

/// Severity of a single review issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Suggestion,
    Warning,
    Error,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Suggestion => "suggestion",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for IssueSeverity {
    type Err = IssueSeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suggestion" => Ok(Self::Suggestion),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(IssueSeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`IssueSeverity`] string.
#[derive(Debug, Clone)]
pub struct IssueSeverityParseError(pub String);

impl fmt::Display for IssueSeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid issue severity: {:?}", self.0)
    }
}

impl std::error::Error for IssueSeverityParseError {}

// ---------------------------------------------------------------------------

/// Status of a pull request opened for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Open,
    Merged,
    Closed,
}

impl fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for PullRequestStatus {
    type Err = PullRequestStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            other => Err(PullRequestStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PullRequestStatus`] string.
#[derive(Debug, Clone)]
pub struct PullRequestStatusParseError(pub String);

impl fmt::Display for PullRequestStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pull request status: {:?}", self.0)
    }
}

impl std::error::Error for PullRequestStatusParseError {}

// ---------------------------------------------------------------------------

/// Delivery channel of a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Telegram,
    Slack,
    Webhook,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

impl FromStr for NotificationChannel {
    type Err = NotificationChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Self::Telegram),
            "slack" => Ok(Self::Slack),
            "webhook" => Ok(Self::Webhook),
            other => Err(NotificationChannelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NotificationChannel`] string.
#[derive(Debug, Clone)]
pub struct NotificationChannelParseError(pub String);

impl fmt::Display for NotificationChannelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid notification channel: {:?}", self.0)
    }
}

impl std::error::Error for NotificationChannelParseError {}

// ---------------------------------------------------------------------------

/// Status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for QueueJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueJobStatus {
    type Err = QueueJobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueJobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`QueueJobStatus`] string.
#[derive(Debug, Clone)]
pub struct QueueJobStatusParseError(pub String);

impl fmt::Display for QueueJobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid queue job status: {:?}", self.0)
    }
}

impl std::error::Error for QueueJobStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the top-level unit of human intent, tied to one board item.
///
/// May be *simple* (internal subtasks only) or an *epic* (`is_epic`, with
/// child tasks carrying `parent_task_id`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub external_board_item_id: String,
    pub external_project_id: String,
    pub repository_full_name: String,
    pub repository_id: i64,
    pub installation_id: i64,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub branch_name: Option<String>,
    pub pr_number: Option<i32>,
    pub pr_url: Option<String>,
    /// May transiently hold a serialised list of review issues awaiting a fix.
    pub error_message: Option<String>,
    pub human_review_question: Option<String>,
    pub human_review_answer: Option<String>,
    pub retry_count: i32,
    pub is_epic: bool,
    pub parent_task_id: Option<Uuid>,
    pub linked_issue_number: Option<i32>,
    /// Titles of prerequisite sibling tasks, from the decomposition.
    pub child_dependencies: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A subtask -- an individual unit of agent work belonging to one task,
/// scoped to a subproject.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub subproject_path: String,
    pub title: String,
    pub description: String,
    pub status: SubtaskStatus,
    pub depends_on: Json<Vec<Uuid>>,
    pub agent_run_id: Option<Uuid>,
    pub files_modified: Json<Vec<String>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single agent invocation: the Decomposer, a subtask worker, or the
/// Reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRun {
    pub id: Uuid,
    pub task_id: Uuid,
    /// `None` for master (decomposition) and code-review runs.
    pub subtask_id: Option<Uuid>,
    pub run_type: AgentRunType,
    pub status: AgentRunStatus,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    /// Append-only transcript of progress messages.
    pub log_text: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A code review produced by the Reviewer against a task's accumulated diff.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CodeReview {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_run_id: Uuid,
    pub result: CodeReviewResult,
    /// 1-based, strictly monotonic per task.
    pub iteration: i32,
    pub summary: String,
    pub issues: Json<Vec<ReviewIssue>>,
    pub created_at: DateTime<Utc>,
}

/// A single issue raised within a [`CodeReview`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    pub line: Option<i32>,
    pub severity: IssueSeverity,
    pub message: String,
    pub suggestion: Option<String>,
}

/// A pull request opened by the Task Processor for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PullRequest {
    pub id: Uuid,
    pub task_id: Uuid,
    pub repository_full_name: String,
    pub pr_number: i32,
    pub title: String,
    pub body: String,
    pub branch_name: String,
    pub head_commit_id: String,
    pub url: String,
    pub status: PullRequestStatus,
    pub reviews_passed: bool,
    pub check_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An outbound notification for a chat/webhook transport.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub notification_type: String,
    pub channel: NotificationChannel,
    pub payload: Json<serde_json::Value>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A durable job in a named work queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueJob {
    pub id: Uuid,
    pub queue_name: String,
    pub job_id: String,
    pub payload: Json<serde_json::Value>,
    pub status: QueueJobStatus,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
