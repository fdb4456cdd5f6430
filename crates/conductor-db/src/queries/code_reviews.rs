//! Database query functions for the `code_reviews` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{CodeReview, CodeReviewResult, ReviewIssue};

/// Insert a new code review row for a task at the next iteration number.
pub async fn insert_review(
    pool: &PgPool,
    task_id: Uuid,
    agent_run_id: Uuid,
    result: CodeReviewResult,
    summary: &str,
    issues: &[ReviewIssue],
) -> Result<CodeReview> {
    let review = sqlx::query_as::<_, CodeReview>(
        "INSERT INTO code_reviews (task_id, agent_run_id, iteration, result, summary, issues) \
         VALUES ( \
             $1, $2, \
             COALESCE((SELECT MAX(iteration) FROM code_reviews WHERE task_id = $1), 0) + 1, \
             $3, $4, $5 \
         ) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(agent_run_id)
    .bind(result)
    .bind(summary)
    .bind(Json(issues))
    .fetch_one(pool)
    .await
    .context("failed to insert code review")?;

    Ok(review)
}

/// List all reviews recorded for a task, oldest iteration first.
pub async fn list_reviews_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<CodeReview>> {
    let reviews = sqlx::query_as::<_, CodeReview>(
        "SELECT * FROM code_reviews WHERE task_id = $1 ORDER BY iteration ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list code reviews for task")?;

    Ok(reviews)
}

/// Fetch the most recent review recorded for a task, if any.
pub async fn latest_review_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<CodeReview>> {
    let review = sqlx::query_as::<_, CodeReview>(
        "SELECT * FROM code_reviews WHERE task_id = $1 ORDER BY iteration DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest code review")?;

    Ok(review)
}
