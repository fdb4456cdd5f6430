//! Subtask Processor: runs one subtask end to end -- prepares its
//! workspace, invokes an agent, and records the outcome.
//!
//! Directly modeled on the lifecycle procedure the fleet orchestrator used
//! to drive a single agent run to completion, re-scoped from a
//! worktree-per-attempt model to a workspace-per-task model.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{AgentRunStatus, AgentRunType, SubtaskStatus, Task};
use conductor_db::queries::{agent_runs, subtasks, tasks};

use crate::config::render_branch_name;
use crate::forge::SourceForgeClient;
use crate::harness::{run_to_completion, HarnessRegistry, MaterializedTask};
use crate::state::subtask_machine;
use crate::workspace::WorkspaceManager;

pub struct SubtaskProcessorContext<'a> {
    pub pool: &'a PgPool,
    pub workspace_manager: &'a WorkspaceManager,
    pub harness_registry: &'a HarnessRegistry,
    pub forge_client: &'a dyn SourceForgeClient,
    pub harness_name: &'a str,
    pub branch_pattern: &'a str,
    pub subtask_timeout: Duration,
}

/// Run one subtask: pending -> queued -> running -> completed|failed.
pub async fn process_subtask(ctx: &SubtaskProcessorContext<'_>, task: &Task, subtask_id: Uuid) -> Result<()> {
    let subtask = subtasks::get_subtask(ctx.pool, subtask_id)
        .await?
        .context("subtask not found")?;

    subtask_machine::transition(ctx.pool, subtask.id, SubtaskStatus::Pending, SubtaskStatus::Queued).await?;
    subtask_machine::transition(ctx.pool, subtask.id, SubtaskStatus::Queued, SubtaskStatus::Running).await?;

    let run = agent_runs::insert_agent_run(
        ctx.pool,
        task.id,
        Some(subtask.id),
        AgentRunType::SubAgent,
        ctx.harness_name,
    )
    .await?;
    subtasks::set_agent_run_id(ctx.pool, subtask.id, run.id).await?;

    let result = run_subtask_inner(ctx, task, &subtask, run.id).await;

    match result {
        Ok(files_modified) => {
            agent_runs::finish_run(ctx.pool, run.id, AgentRunStatus::Completed).await?;
            subtasks::set_files_modified(ctx.pool, subtask.id, &files_modified).await?;
            subtask_machine::transition(ctx.pool, subtask.id, SubtaskStatus::Running, SubtaskStatus::Completed)
                .await?;
            Ok(())
        }
        Err(e) => {
            agent_runs::finish_run(ctx.pool, run.id, AgentRunStatus::Failed).await?;
            subtasks::set_error_message(ctx.pool, subtask.id, &e.to_string()).await?;
            subtask_machine::transition(ctx.pool, subtask.id, SubtaskStatus::Running, SubtaskStatus::Failed).await?;
            Err(e)
        }
    }
}

async fn run_subtask_inner(
    ctx: &SubtaskProcessorContext<'_>,
    task: &Task,
    subtask: &conductor_db::models::Subtask,
    run_id: Uuid,
) -> Result<Vec<String>> {
    agent_runs::mark_running(ctx.pool, run_id).await?;

    let branch_name = task
        .branch_name
        .clone()
        .unwrap_or_else(|| render_branch_name(ctx.branch_pattern, task.id, &task.title));

    let clone_url = ctx
        .forge_client
        .scoped_clone_url(&task.repository_full_name, task.installation_id)
        .await
        .context("failed to obtain scoped clone url")?;
    let base_branch = ctx
        .forge_client
        .default_branch(&task.repository_full_name)
        .await
        .unwrap_or_else(|_| "main".to_string());

    let workspace = ctx
        .workspace_manager
        .prepare(task.id, &clone_url, &base_branch, &branch_name)?;

    if task.branch_name.is_none() {
        tasks::set_branch_name(ctx.pool, task.id, &branch_name).await?;
    }

    let harness = ctx
        .harness_registry
        .get(ctx.harness_name)
        .with_context(|| format!("unknown harness {:?}", ctx.harness_name))?;

    let working_dir = if subtask.subproject_path == "." {
        workspace.path.clone()
    } else {
        workspace.path.join(&subtask.subproject_path)
    };

    let materialized = MaterializedTask {
        task_id: task.id,
        name: subtask.title.clone(),
        description: subtask.description.clone(),
        invariant_commands: vec![],
        working_dir,
        env_vars: HashMap::new(),
    };

    let handle = harness.spawn(&materialized).await.context("failed to spawn subtask agent")?;
    let result = run_to_completion(harness, &handle, ctx.subtask_timeout).await?;

    agent_runs::add_usage(
        ctx.pool,
        run_id,
        result.input_tokens,
        result.output_tokens,
        result.total_cost_usd.unwrap_or(0.0),
    )
    .await?;

    if let Err(e) = ctx
        .workspace_manager
        .commit_and_push(&workspace, &format!("conductor: {} (attempt 1)", subtask.title))
    {
        tracing::warn!(subtask_id = %subtask.id, error = %e, "commit_and_push failed, continuing");
    }

    if !result.success {
        anyhow::bail!("subtask agent run did not succeed: {}", result.output);
    }

    Ok(result.files_modified)
}
