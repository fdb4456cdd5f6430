//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new simple or top-level task row. Returns the inserted task with
/// server-generated defaults (id, created_at, status).
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    external_board_item_id: &str,
    external_project_id: &str,
    repository_full_name: &str,
    repository_id: i64,
    installation_id: i64,
    title: &str,
    description: &str,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (external_board_item_id, external_project_id, repository_full_name, \
             repository_id, installation_id, title, description) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(external_board_item_id)
    .bind(external_project_id)
    .bind(repository_full_name)
    .bind(repository_id)
    .bind(installation_id)
    .bind(title)
    .bind(description)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Insert a child task of an epic, with `parent_task_id` set and the linked
/// external issue recorded.
#[allow(clippy::too_many_arguments)]
pub async fn insert_child_task(
    pool: &PgPool,
    parent_task_id: Uuid,
    repository_full_name: &str,
    repository_id: i64,
    installation_id: i64,
    title: &str,
    description: &str,
    linked_issue_number: i32,
    child_dependencies: &[String],
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (external_board_item_id, external_project_id, repository_full_name, \
             repository_id, installation_id, title, description, \
             parent_task_id, linked_issue_number, child_dependencies) \
         VALUES ('', '', $1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(repository_full_name)
    .bind(repository_id)
    .bind(installation_id)
    .bind(title)
    .bind(description)
    .bind(parent_task_id)
    .bind(linked_issue_number)
    .bind(Json(child_dependencies))
    .fetch_one(pool)
    .await
    .context("failed to insert child task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch the task (if any) tied to an external board item id.
pub async fn get_task_by_board_item_id(
    pool: &PgPool,
    external_board_item_id: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE external_board_item_id = $1",
    )
    .bind(external_board_item_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch task by board item id")?;

    Ok(task)
}

/// List all child tasks of an epic, in creation order.
pub async fn list_children(pool: &PgPool, parent_task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE parent_task_id = $1 ORDER BY created_at ASC",
    )
    .bind(parent_task_id)
    .fetch_all(pool)
    .await
    .context("failed to list child tasks")?;

    Ok(tasks)
}

/// List all tasks, most recently created first.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// still matches the expected value. Returns the number of rows affected
/// (0 means the status had already moved on).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             updated_at = NOW(), \
             started_at = COALESCE(started_at, $2), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Set the task's branch name once the Workspace Manager has created it.
pub async fn set_branch_name(pool: &PgPool, task_id: Uuid, branch_name: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET branch_name = $1, updated_at = NOW() WHERE id = $2")
        .bind(branch_name)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task branch name")?;

    Ok(result.rows_affected())
}

/// Record the pull request number/url opened for a task.
pub async fn set_pull_request(
    pool: &PgPool,
    task_id: Uuid,
    pr_number: i32,
    pr_url: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET pr_number = $1, pr_url = $2, updated_at = NOW() WHERE id = $3",
    )
    .bind(pr_number)
    .bind(pr_url)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task pull request")?;

    Ok(result.rows_affected())
}

/// Store an error message on a task (e.g. a serialised review-issues list,
/// or a failure description), without changing its status.
pub async fn set_error_message(pool: &PgPool, task_id: Uuid, error_message: Option<&str>) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET error_message = $1, updated_at = NOW() WHERE id = $2")
        .bind(error_message)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task error message")?;

    Ok(result.rows_affected())
}

/// Record a human-review question, transitioning the caller separately.
pub async fn set_human_review_question(
    pool: &PgPool,
    task_id: Uuid,
    question: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET human_review_question = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(question)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set human review question")?;

    Ok(result.rows_affected())
}

/// Record a human-review answer gathered from a board/issue/PR comment.
pub async fn set_human_review_answer(
    pool: &PgPool,
    task_id: Uuid,
    answer: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET human_review_answer = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(answer)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set human review answer")?;

    Ok(result.rows_affected())
}

/// Mark a task as an epic once its decomposition resolves to child work items.
pub async fn mark_as_epic(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET is_epic = true, updated_at = NOW() WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to mark task as epic")?;

    Ok(result.rows_affected())
}

/// Reset a `failed` task to `pending` and increment its retry count, used by
/// the `/conductor retry` command.
pub async fn retry_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', retry_count = retry_count + 1, \
             error_message = NULL, updated_at = NOW() \
         WHERE id = $1 AND status = 'failed'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// The number of `code_reviews` rows recorded for a task, used as the
/// review-iteration counter. Not reset across human_review round trips.
pub async fn count_review_iterations(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM code_reviews WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .context("failed to count review iterations")?;

    Ok(row.0)
}

/// Count tasks grouped by status, for the `/status` surface and metrics.
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(TaskStatus, i64)>> {
    let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks GROUP BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tasks by status")?;

    Ok(rows)
}

/// Average wall-clock duration of completed tasks, in seconds, for metrics.
/// `None` when no task has both a `started_at` and `completed_at` yet.
pub async fn average_duration_seconds(pool: &PgPool) -> Result<Option<f64>> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at))) \
         FROM tasks WHERE status = 'done' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute average task duration")?;

    Ok(row.0)
}

/// Reset tasks stuck in `decomposing`/`executing`/`review` back to `failed`
/// so a restarted process can decide whether to retry or escalate them.
///
/// Restart recovery: if the process hosting the Task Processor crashes
/// mid-run, tasks left in an intermediate state would otherwise never make
/// further progress, since nothing is watching them. Returns the tasks that
/// were reset.
pub async fn reset_orphaned_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', \
             completed_at = NOW(), \
             updated_at = NOW() \
         WHERE status IN ('decomposing', 'executing', 'review') \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned tasks")?;

    Ok(tasks)
}
