//! `conductor status` command: show task and subtask counts by status.

use anyhow::Result;
use sqlx::PgPool;

use conductor_db::queries::{agent_runs, subtasks, tasks};

/// Print a summary of how many tasks and subtasks sit in each status, plus
/// running token/cost totals.
pub async fn run_status(pool: &PgPool) -> Result<()> {
    let task_counts = tasks::count_by_status(pool).await?;
    let subtask_counts = subtasks::count_by_status(pool).await?;
    let (input_tokens, output_tokens, cost_usd) = agent_runs::global_totals(pool).await?;

    println!("Tasks:");
    if task_counts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &task_counts {
        println!("  {status:<16} {count}");
    }

    println!();
    println!("Subtasks:");
    if subtask_counts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &subtask_counts {
        println!("  {status:<16} {count}");
    }

    println!();
    println!("Tokens: {input_tokens} in / {output_tokens} out (${cost_usd:.2})");

    Ok(())
}
