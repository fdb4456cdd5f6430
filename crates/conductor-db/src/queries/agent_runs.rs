//! Database query functions for the `agent_runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentRun, AgentRunStatus, AgentRunType};

/// Insert a new agent run row in `starting` status.
pub async fn insert_agent_run(
    pool: &PgPool,
    task_id: Uuid,
    subtask_id: Option<Uuid>,
    run_type: AgentRunType,
    model: &str,
) -> Result<AgentRun> {
    let run = sqlx::query_as::<_, AgentRun>(
        "INSERT INTO agent_runs (task_id, subtask_id, run_type, model) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(subtask_id)
    .bind(run_type)
    .bind(model)
    .fetch_one(pool)
    .await
    .context("failed to insert agent run")?;

    Ok(run)
}

/// Move a run from `starting` to `running`.
pub async fn mark_running(pool: &PgPool, run_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE agent_runs SET status = 'running' WHERE id = $1")
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to mark agent run running")?;

    Ok(result.rows_affected())
}

/// Add a batch of token/cost usage to a run's running totals. Token counters
/// are monotonic non-decreasing.
pub async fn add_usage(
    pool: &PgPool,
    run_id: Uuid,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: f64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_runs \
         SET input_tokens = input_tokens + $1, \
             output_tokens = output_tokens + $2, \
             cost_usd = cost_usd + $3 \
         WHERE id = $4",
    )
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(cost_usd)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to add agent run usage")?;

    Ok(result.rows_affected())
}

/// Append a line to a run's transcript.
pub async fn append_log(pool: &PgPool, run_id: Uuid, line: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_runs SET log_text = log_text || $1 || E'\\n' WHERE id = $2",
    )
    .bind(line)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to append agent run log")?;

    Ok(result.rows_affected())
}

/// Mark a run as finished, with its final status.
pub async fn finish_run(pool: &PgPool, run_id: Uuid, status: AgentRunStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_runs SET status = $1, completed_at = NOW() WHERE id = $2",
    )
    .bind(status)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to finish agent run")?;

    Ok(result.rows_affected())
}

/// Fetch a single agent run by ID.
pub async fn get_agent_run(pool: &PgPool, id: Uuid) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>("SELECT * FROM agent_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent run")?;

    Ok(run)
}

/// List all agent runs recorded for a task, most recent first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE task_id = $1 ORDER BY started_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list agent runs for task")?;

    Ok(runs)
}

/// Sum of all tokens and cost consumed by every run across a task, used for
/// the token/cost metrics counters.
pub async fn totals_for_task(pool: &PgPool, task_id: Uuid) -> Result<(i64, i64, f64)> {
    let row: (Option<i64>, Option<i64>, Option<f64>) = sqlx::query_as(
        "SELECT SUM(input_tokens), SUM(output_tokens), SUM(cost_usd) \
         FROM agent_runs WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to sum task token/cost usage")?;

    Ok((row.0.unwrap_or(0), row.1.unwrap_or(0), row.2.unwrap_or(0.0)))
}

/// Sum of all tokens and cost consumed across every run, for the global
/// metrics counters (as opposed to [`totals_for_task`], scoped to one task).
pub async fn global_totals(pool: &PgPool) -> Result<(i64, i64, f64)> {
    let row: (Option<i64>, Option<i64>, Option<f64>) = sqlx::query_as(
        "SELECT SUM(input_tokens), SUM(output_tokens), SUM(cost_usd) FROM agent_runs",
    )
    .fetch_one(pool)
    .await
    .context("failed to sum global token/cost usage")?;

    Ok((row.0.unwrap_or(0), row.1.unwrap_or(0), row.2.unwrap_or(0.0)))
}

/// Count agent runs grouped by type, for the metrics endpoint.
pub async fn count_by_type(pool: &PgPool) -> Result<Vec<(AgentRunType, i64)>> {
    let rows: Vec<(AgentRunType, i64)> = sqlx::query_as(
        "SELECT run_type, COUNT(*) FROM agent_runs GROUP BY run_type",
    )
    .fetch_all(pool)
    .await
    .context("failed to count agent runs by type")?;

    Ok(rows)
}
