//! Database query functions for the `queue_jobs` table.
//!
//! Implements a durable, named, multi-consumer work queue on top of
//! Postgres: `enqueue` deduplicates by `(queue_name, job_id)`, `claim` uses
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never block on or steal
//! each other's rows, and `release_for_retry`/`fail` implement exponential
//! backoff up to a per-job attempt cap.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::QueueJob;

/// Enqueue a job. If a job with the same `(queue_name, job_id)` already
/// exists, this is a no-op -- enqueueing is idempotent.
pub async fn enqueue(
    pool: &PgPool,
    queue_name: &str,
    job_id: &str,
    payload: serde_json::Value,
    max_attempts: i32,
) -> Result<Option<QueueJob>> {
    let job = sqlx::query_as::<_, QueueJob>(
        "INSERT INTO queue_jobs (queue_name, job_id, payload, max_attempts) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (queue_name, job_id) DO NOTHING \
         RETURNING *",
    )
    .bind(queue_name)
    .bind(job_id)
    .bind(Json(payload))
    .bind(max_attempts)
    .fetch_optional(pool)
    .await
    .context("failed to enqueue job")?;

    Ok(job)
}

/// Claim the oldest runnable job on a queue and mark it `running`.
///
/// `FOR UPDATE SKIP LOCKED` means a concurrent consumer racing for the same
/// row simply moves on to the next candidate rather than waiting.
pub async fn claim(pool: &PgPool, queue_name: &str) -> Result<Option<QueueJob>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let candidate: Option<QueueJob> = sqlx::query_as(
        "SELECT * FROM queue_jobs \
         WHERE queue_name = $1 AND status = 'pending' AND run_at <= NOW() \
         ORDER BY run_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(queue_name)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select claimable job")?;

    let Some(candidate) = candidate else {
        tx.rollback().await.ok();
        return Ok(None);
    };

    let claimed = sqlx::query_as::<_, QueueJob>(
        "UPDATE queue_jobs \
         SET status = 'running', attempts = attempts + 1, updated_at = NOW() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(candidate.id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to mark job running")?;

    tx.commit().await.context("failed to commit claim transaction")?;

    Ok(Some(claimed))
}

/// Mark a claimed job `completed`.
pub async fn complete(pool: &PgPool, job_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE queue_jobs SET status = 'completed', updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to complete job")?;

    Ok(result.rows_affected())
}

/// Exponential backoff schedule: 5s, 10s, 20s, ... capped at 60s.
pub fn backoff_delay(attempts: i32) -> chrono::Duration {
    let base_secs: i64 = 5;
    let cap_secs: i64 = 60;
    let secs = base_secs.saturating_mul(1i64 << attempts.clamp(0, 8)).min(cap_secs);
    chrono::Duration::seconds(secs)
}

/// Release a failed job back to `pending` with a backoff delay if it has
/// attempts remaining, otherwise mark it permanently `failed`.
pub async fn release_for_retry_or_fail(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
) -> Result<QueueJob> {
    let job: QueueJob = sqlx::query_as("SELECT * FROM queue_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("failed to fetch job for retry decision")?;

    if job.attempts < job.max_attempts {
        let run_at: DateTime<Utc> = Utc::now() + backoff_delay(job.attempts);
        let updated = sqlx::query_as::<_, QueueJob>(
            "UPDATE queue_jobs \
             SET status = 'pending', run_at = $1, last_error = $2, updated_at = NOW() \
             WHERE id = $3 \
             RETURNING *",
        )
        .bind(run_at)
        .bind(error)
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("failed to reschedule job")?;
        Ok(updated)
    } else {
        let updated = sqlx::query_as::<_, QueueJob>(
            "UPDATE queue_jobs \
             SET status = 'failed', last_error = $1, updated_at = NOW() \
             WHERE id = $2 \
             RETURNING *",
        )
        .bind(error)
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("failed to mark job failed")?;
        Ok(updated)
    }
}

/// Reset jobs orphaned in `running` (e.g. by a process crash) back to
/// `pending` so another consumer can pick them up.
pub async fn reset_orphaned_jobs(pool: &PgPool, queue_name: &str) -> Result<Vec<QueueJob>> {
    let jobs = sqlx::query_as::<_, QueueJob>(
        "UPDATE queue_jobs \
         SET status = 'pending', updated_at = NOW() \
         WHERE queue_name = $1 AND status = 'running' \
         RETURNING *",
    )
    .bind(queue_name)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned queue jobs")?;

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), chrono::Duration::seconds(5));
        assert_eq!(backoff_delay(1), chrono::Duration::seconds(10));
        assert_eq!(backoff_delay(2), chrono::Duration::seconds(20));
        assert_eq!(backoff_delay(10), chrono::Duration::seconds(60));
    }
}
