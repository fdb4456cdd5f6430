//! Database query functions for the `pull_requests` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PullRequest, PullRequestStatus};

/// Record a newly opened pull request for a task.
#[allow(clippy::too_many_arguments)]
pub async fn insert_pull_request(
    pool: &PgPool,
    task_id: Uuid,
    repository_full_name: &str,
    pr_number: i32,
    title: &str,
    body: &str,
    branch_name: &str,
    head_commit_id: &str,
    url: &str,
) -> Result<PullRequest> {
    let pr = sqlx::query_as::<_, PullRequest>(
        "INSERT INTO pull_requests \
            (task_id, repository_full_name, pr_number, title, body, branch_name, head_commit_id, url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(repository_full_name)
    .bind(pr_number)
    .bind(title)
    .bind(body)
    .bind(branch_name)
    .bind(head_commit_id)
    .bind(url)
    .fetch_one(pool)
    .await
    .context("failed to insert pull request")?;

    Ok(pr)
}

/// Fetch the pull request associated with a task, if one has been opened.
pub async fn get_pull_request_for_task(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Option<PullRequest>> {
    let pr = sqlx::query_as::<_, PullRequest>(
        "SELECT * FROM pull_requests WHERE task_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pull request for task")?;

    Ok(pr)
}

/// Fetch a pull request by repository and number, used to resolve
/// `pull_request.*` webhook deliveries.
pub async fn get_pull_request_by_number(
    pool: &PgPool,
    repository_full_name: &str,
    pr_number: i32,
) -> Result<Option<PullRequest>> {
    let pr = sqlx::query_as::<_, PullRequest>(
        "SELECT * FROM pull_requests WHERE repository_full_name = $1 AND pr_number = $2",
    )
    .bind(repository_full_name)
    .bind(pr_number)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pull request by number")?;

    Ok(pr)
}

/// Update a pull request's status (e.g. on a PR-closed/merged webhook).
pub async fn update_status(
    pool: &PgPool,
    id: Uuid,
    status: PullRequestStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pull_requests SET status = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update pull request status")?;

    Ok(result.rows_affected())
}

/// Record the latest head commit on a `synchronize` webhook delivery.
pub async fn update_head_commit(pool: &PgPool, id: Uuid, head_commit_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pull_requests SET head_commit_id = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(head_commit_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update pull request head commit")?;

    Ok(result.rows_affected())
}
