//! Reviewer: runs one code-review iteration for a task's accumulated
//! changes and decides whether the work is approved, needs another fix
//! pass, or has exhausted its iteration budget.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{AgentRunStatus, AgentRunType, CodeReviewResult, IssueSeverity, ReviewIssue, Task};
use conductor_db::queries::{agent_runs, code_reviews, subtasks, tasks};

use crate::forge::SourceForgeClient;
use crate::harness::{run_to_completion, Harness, MaterializedTask};

const MAX_ITERATIONS: i64 = 3;
const PASS_THRESHOLD: usize = 0;
const REVIEW_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const REVIEW_SYSTEM_PROMPT: &str = "You are the code review agent for an autonomous software \
engineering system. Examine the provided diff (or file contents) against the task description \
and report issues. Respond with a single JSON code block: \
{\"result\": \"approved\"|\"changes_requested\", \"summary\": string, \
\"issues\": [{\"file\": string, \"line\": number|null, \"severity\": \
\"suggestion\"|\"warning\"|\"error\", \"message\": string, \"suggestion\": string|null}]}.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewResponse {
    result: ReviewVerdict,
    summary: String,
    #[serde(default)]
    issues: Vec<ReviewIssueJson>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewIssueJson {
    file: String,
    line: Option<i32>,
    severity: IssueSeverity,
    message: String,
    suggestion: Option<String>,
}

/// Outcome of a review invocation, mirroring the gate-action shape: approve
/// outright, request changes with iterations remaining, or force failure
/// once the iteration budget is spent.
#[derive(Debug, Clone)]
pub enum ReviewAction {
    Approved,
    ChangesRequested { issues: Vec<ReviewIssue> },
    MaxIterationsReached,
}

pub async fn run_review(
    pool: &PgPool,
    task: &Task,
    repo_root: &Path,
    client: &dyn SourceForgeClient,
    harness: &dyn Harness,
) -> Result<ReviewAction> {
    let iteration = tasks::count_review_iterations(pool, task.id).await? + 1;

    if iteration > MAX_ITERATIONS {
        return Ok(ReviewAction::MaxIterationsReached);
    }

    let run = agent_runs::insert_agent_run(pool, task.id, None, AgentRunType::CodeReview, "review")
        .await
        .context("failed to insert review agent run")?;
    agent_runs::mark_running(pool, run.id).await?;

    let modified_files = modified_files_for_task(pool, task.id).await?;
    let diff = diff_or_fallback(client, task, repo_root, &modified_files).await;

    let prompt = build_review_prompt(task, &diff);
    let materialized = MaterializedTask {
        task_id: task.id,
        name: format!("review: {}", task.title),
        description: format!("{REVIEW_SYSTEM_PROMPT}\n\n{prompt}"),
        invariant_commands: vec![],
        working_dir: repo_root.to_path_buf(),
        env_vars: HashMap::new(),
    };

    let handle = harness.spawn(&materialized).await.context("failed to spawn reviewer agent")?;
    let result = run_to_completion(harness, &handle, REVIEW_TIMEOUT).await?;

    agent_runs::add_usage(
        pool,
        run.id,
        result.input_tokens,
        result.output_tokens,
        result.total_cost_usd.unwrap_or(0.0),
    )
    .await?;

    let parsed = parse_review(&result.output)?;
    let error_count = parsed.issues.iter().filter(|i| i.severity == IssueSeverity::Error).count();
    let forced_approved = error_count <= PASS_THRESHOLD;

    let final_result = if forced_approved {
        CodeReviewResult::Approved
    } else {
        CodeReviewResult::ChangesRequested
    };

    let issues: Vec<ReviewIssue> = parsed
        .issues
        .into_iter()
        .map(|i| ReviewIssue {
            file: i.file,
            line: i.line,
            severity: i.severity,
            message: i.message,
            suggestion: i.suggestion,
        })
        .collect();

    code_reviews::insert_review(pool, task.id, run.id, final_result, &parsed.summary, &issues).await?;
    agent_runs::finish_run(pool, run.id, AgentRunStatus::Completed).await?;

    if forced_approved {
        Ok(ReviewAction::Approved)
    } else {
        Ok(ReviewAction::ChangesRequested { issues })
    }
}

async fn modified_files_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<String>> {
    let subtask_rows = subtasks::list_subtasks_for_task(pool, task_id).await?;
    let mut files = std::collections::BTreeSet::new();
    for subtask in subtask_rows {
        for file in subtask.files_modified.0 {
            files.insert(file);
        }
    }
    Ok(files.into_iter().collect())
}

async fn diff_or_fallback(
    client: &dyn SourceForgeClient,
    task: &Task,
    repo_root: &Path,
    modified_files: &[String],
) -> String {
    let base = task.branch_name.clone().unwrap_or_default();
    if let Some(branch) = &task.branch_name {
        if let Ok(Some(diff)) = client
            .compare_commits(&task.repository_full_name, &base, branch)
            .await
        {
            return diff;
        }
    }

    let mut fallback = String::new();
    for path in modified_files {
        if let Ok(content) = std::fs::read_to_string(repo_root.join(path)) {
            fallback.push_str(&format!("--- {path}\n{content}\n"));
        }
    }
    fallback
}

fn build_review_prompt(task: &Task, diff: &str) -> String {
    format!(
        "## Task\nTitle: {}\nDescription: {}\n\n## Changes\n{}",
        task.title, task.description, diff
    )
}

fn parse_review(output: &str) -> Result<ReviewResponse> {
    let fenced = extract_fenced_json(output)
        .ok_or_else(|| anyhow::anyhow!("reviewer response did not contain a fenced JSON block"))?;
    serde_json::from_str(&fenced).context("failed to parse review JSON")
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let start_marker = text.find("```json").map(|i| i + "```json".len())?;
    let rest = &text[start_marker..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}
