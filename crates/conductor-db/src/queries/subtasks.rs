//! Database query functions for the `subtasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Subtask, SubtaskStatus};

/// Insert a new subtask row belonging to a task, scoped to a subproject.
pub async fn insert_subtask(
    pool: &PgPool,
    task_id: Uuid,
    subproject_path: &str,
    title: &str,
    description: &str,
    depends_on: &[Uuid],
) -> Result<Subtask> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks (task_id, subproject_path, title, description, depends_on) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(subproject_path)
    .bind(title)
    .bind(description)
    .bind(Json(depends_on))
    .fetch_one(pool)
    .await
    .context("failed to insert subtask")?;

    Ok(subtask)
}

/// Fetch a single subtask by ID.
pub async fn get_subtask(pool: &PgPool, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// List all subtasks for a given task, in creation order.
pub async fn list_subtasks_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks for task")?;

    Ok(subtasks)
}

/// Get every `pending` subtask of a task whose dependencies have all reached
/// `completed`. These are ready to be enqueued onto the `subtasks` queue.
pub async fn get_ready_subtasks(pool: &PgPool, task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT s.* \
         FROM subtasks s \
         WHERE s.task_id = $1 \
           AND s.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 \
               FROM jsonb_array_elements_text(s.depends_on) AS dep(id) \
               JOIN subtasks other ON other.id = dep.id::uuid \
               WHERE other.status != 'completed' \
           )",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get ready subtasks")?;

    Ok(subtasks)
}

/// Atomically transition a subtask from one status to another, using
/// optimistic locking on the current status. `started_at` is stamped once on
/// first entry to `running`; `completed_at` on `completed`/`failed`.
pub async fn transition_subtask_status(
    pool: &PgPool,
    subtask_id: Uuid,
    from: SubtaskStatus,
    to: SubtaskStatus,
) -> Result<u64> {
    let started_clause = if matches!(to, SubtaskStatus::Running) {
        "COALESCE(started_at, NOW())"
    } else {
        "started_at"
    };
    let completed_clause = if matches!(to, SubtaskStatus::Completed | SubtaskStatus::Failed) {
        "NOW()"
    } else {
        "completed_at"
    };

    let query = format!(
        "UPDATE subtasks \
         SET status = $1, started_at = {started_clause}, completed_at = {completed_clause} \
         WHERE id = $2 AND status = $3"
    );

    let result = sqlx::query(&query)
        .bind(to)
        .bind(subtask_id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition subtask status")?;

    Ok(result.rows_affected())
}

/// Record the agent run backing a subtask's latest attempt.
pub async fn set_agent_run_id(pool: &PgPool, subtask_id: Uuid, agent_run_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE subtasks SET agent_run_id = $1 WHERE id = $2")
        .bind(agent_run_id)
        .bind(subtask_id)
        .execute(pool)
        .await
        .context("failed to set subtask agent run id")?;

    Ok(result.rows_affected())
}

/// Record the files an agent run touched.
pub async fn set_files_modified(pool: &PgPool, subtask_id: Uuid, files: &[String]) -> Result<u64> {
    let result = sqlx::query("UPDATE subtasks SET files_modified = $1 WHERE id = $2")
        .bind(Json(files))
        .bind(subtask_id)
        .execute(pool)
        .await
        .context("failed to set subtask files_modified")?;

    Ok(result.rows_affected())
}

/// Record a failure message on a subtask, without changing its status.
pub async fn set_error_message(pool: &PgPool, subtask_id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE subtasks SET error_message = $1 WHERE id = $2")
        .bind(error_message)
        .bind(subtask_id)
        .execute(pool)
        .await
        .context("failed to set subtask error message")?;

    Ok(result.rows_affected())
}

/// Check whether a task has at least one subtask and every subtask has
/// reached `completed` (`areAllSubtasksComplete`).
pub async fn is_task_fully_completed(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE status != 'completed') \
         FROM subtasks WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check subtask completion")?;

    let (total, incomplete) = row;
    Ok(total > 0 && incomplete == 0)
}

/// Count subtasks grouped by status, for metrics.
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(SubtaskStatus, i64)>> {
    let rows: Vec<(SubtaskStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM subtasks GROUP BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count subtasks by status")?;

    Ok(rows)
}

/// Reset subtasks stuck in `running` back to `failed`, for restart recovery.
pub async fn reset_orphaned_subtasks(pool: &PgPool) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "UPDATE subtasks \
         SET status = 'failed', completed_at = NOW() \
         WHERE status = 'running' \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned subtasks")?;

    Ok(subtasks)
}
