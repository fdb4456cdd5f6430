//! Task Processor: consumes one job at a time from the `tasks` queue and
//! drives a task through decompose/execute/review/fix/create_pr/smoke_test.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{QueueJob, Task, TaskStatus};
use conductor_db::queries::{pull_requests, subtasks, tasks};

use crate::config::{render_branch_name, ProjectConfig};
use crate::decomposer::{self, DecomposeOutcome};
use crate::fixer;
use crate::forge::{IssueCreate, PullRequestCreate, SourceForgeClient};
use crate::harness::HarnessRegistry;
use crate::invariant;
use crate::queue::Queue;
use crate::reviewer::{self, ReviewAction};
use crate::state::{subtask_machine, task_machine};
use crate::workspace::WorkspaceManager;

const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Decompose,
    Execute,
    Review,
    Fix,
    CreatePr,
    SmokeTest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskJobPayload {
    pub task_id: Uuid,
    pub action: TaskAction,
}

pub struct TaskProcessorContext<'a> {
    pub pool: &'a PgPool,
    pub task_queue: &'a Queue,
    pub subtask_queue: &'a Queue,
    pub notification_queue: &'a Queue,
    pub forge_client: &'a dyn SourceForgeClient,
    pub harness_registry: &'a HarnessRegistry,
    pub workspace_manager: &'a WorkspaceManager,
    pub harness_name: &'a str,
}

/// Entry point wired into the `tasks` queue consumer. On any error the
/// owning task is transitioned to `failed` with the error text, then the
/// error is rethrown so the queue's retry/backoff policy applies.
pub async fn handle_task_job(ctx: &TaskProcessorContext<'_>, job: &QueueJob) -> Result<()> {
    let payload: TaskJobPayload =
        serde_json::from_value(job.payload.0.clone()).context("invalid task job payload")?;

    let result = dispatch(ctx, payload.task_id, payload.action).await;

    if let Err(e) = &result {
        if let Ok(Some(task)) = tasks::get_task(ctx.pool, payload.task_id).await {
            let _ = task_machine::transition(ctx.pool, task.id, task.status, TaskStatus::Failed).await;
            let _ = tasks::set_error_message(ctx.pool, task.id, Some(&e.to_string())).await;
        }
    }

    result
}

async fn dispatch(ctx: &TaskProcessorContext<'_>, task_id: Uuid, action: TaskAction) -> Result<()> {
    let task = tasks::get_task(ctx.pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    match action {
        TaskAction::Decompose => do_decompose(ctx, task).await,
        TaskAction::Execute => do_execute(ctx, task).await,
        TaskAction::Review => do_review(ctx, task).await,
        TaskAction::Fix => do_fix(ctx, task).await,
        TaskAction::CreatePr => do_create_pr(ctx, task).await,
        TaskAction::SmokeTest => do_smoke_test(ctx, task).await,
    }
}

async fn load_config(ctx: &TaskProcessorContext<'_>, task: &Task) -> ProjectConfig {
    match ctx
        .forge_client
        .get_file_contents(&task.repository_full_name, ".conductor.yml")
        .await
    {
        Ok(Some(yaml)) => ProjectConfig::parse(&yaml).unwrap_or_else(|_| default_config()),
        _ => default_config(),
    }
}

fn default_config() -> ProjectConfig {
    ProjectConfig::parse("version: \"1.0\"\n").expect("default config is valid")
}

async fn workspace_repo_root(ctx: &TaskProcessorContext<'_>, task_id: Uuid) -> std::path::PathBuf {
    ctx.workspace_manager.workspace_root().join(task_id.to_string())
}

fn task_job_payload(task_id: Uuid, action: TaskAction) -> serde_json::Value {
    serde_json::to_value(TaskJobPayload { task_id, action }).expect("TaskJobPayload always serializes")
}

async fn do_decompose(ctx: &TaskProcessorContext<'_>, task: Task) -> Result<()> {
    task_machine::transition(ctx.pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing).await?;

    if !task.external_project_id.is_empty() {
        let _ = ctx
            .forge_client
            .move_board_item(&task.external_project_id, &task.external_board_item_id, "In Progress")
            .await;
    }

    let repo_root = workspace_repo_root(ctx, task.id).await;
    let outcome = decomposer::decompose(
        &task,
        &repo_root,
        ctx.forge_client,
        ctx.harness_registry
            .get(ctx.harness_name)
            .with_context(|| format!("unknown harness {:?}", ctx.harness_name))?,
    )
    .await?;

    match outcome {
        DecomposeOutcome::NeedsHumanReview { question } => {
            if !task.external_project_id.is_empty() {
                let _ = ctx
                    .forge_client
                    .move_board_item(&task.external_project_id, &task.external_board_item_id, "Human Review")
                    .await;
            }
            if let Some(issue_number) = task.linked_issue_number {
                let _ = ctx
                    .forge_client
                    .comment_on_issue(&task.repository_full_name, i64::from(issue_number), &question)
                    .await;
            }
            tasks::set_human_review_question(ctx.pool, task.id, &question).await?;
            task_machine::transition(ctx.pool, task.id, TaskStatus::Decomposing, TaskStatus::HumanReview).await?;
            ctx.notification_queue
                .enqueue(
                    &format!("human-review-{}", task.id),
                    serde_json::json!({
                        "type": "human_review_needed",
                        "task_id": task.id,
                        "question": question,
                    }),
                    3,
                )
                .await?;
            Ok(())
        }
        DecomposeOutcome::Epic { children } => {
            tasks::mark_as_epic(ctx.pool, task.id).await?;
            for child in &children {
                let labels = vec!["conductor".to_string(), "automated".to_string()];
                let body = format!(
                    "{}\n\nDepends on: {}",
                    child.description,
                    if child.depends_on.is_empty() { "(none)".to_string() } else { child.depends_on.join(", ") }
                );
                let issue_number = ctx
                    .forge_client
                    .create_issue(
                        &task.repository_full_name,
                        IssueCreate { title: child.title.clone(), body, labels },
                    )
                    .await?;
                if !task.external_project_id.is_empty() {
                    let item_id = ctx
                        .forge_client
                        .add_issue_to_board(&task.external_project_id, &task.repository_full_name, issue_number)
                        .await?;
                    let _ = ctx
                        .forge_client
                        .move_board_item(&task.external_project_id, &item_id, "Todo")
                        .await;
                }

                let child_task = tasks::insert_child_task(
                    ctx.pool,
                    task.id,
                    &task.repository_full_name,
                    task.repository_id,
                    task.installation_id,
                    &child.title,
                    &child.description,
                    i32::try_from(issue_number).unwrap_or_default(),
                    &child.depends_on,
                )
                .await?;

                if child.depends_on.is_empty() {
                    ctx.task_queue
                        .enqueue(
                            &format!("decompose-{}", child_task.id),
                            task_job_payload(child_task.id, TaskAction::Decompose),
                            3,
                        )
                        .await?;
                }
            }
            task_machine::transition(ctx.pool, task.id, TaskStatus::Decomposing, TaskStatus::Executing).await?;
            Ok(())
        }
        DecomposeOutcome::Simple { subtasks, .. } => {
            for planned in &subtasks {
                let row = subtasks::insert_subtask(
                    ctx.pool,
                    task.id,
                    &planned.subproject_path,
                    &planned.title,
                    &planned.description,
                    &planned.depends_on,
                )
                .await?;
                ctx.subtask_queue
                    .enqueue(
                        &format!("subtask-{}", row.id),
                        serde_json::json!({ "subtask_id": row.id, "task_id": task.id }),
                        3,
                    )
                    .await?;
            }
            task_machine::transition(ctx.pool, task.id, TaskStatus::Decomposing, TaskStatus::Executing).await?;
            ctx.task_queue
                .enqueue(
                    &format!("check-complete-{}", task.id),
                    task_job_payload(task.id, TaskAction::Execute),
                    3,
                )
                .await?;
            Ok(())
        }
    }
}

async fn do_execute(ctx: &TaskProcessorContext<'_>, task: Task) -> Result<()> {
    if !task.is_epic {
        if !subtask_machine::all_subtasks_complete(ctx.pool, task.id).await? {
            ctx.task_queue
                .enqueue(
                    &format!("check-complete-{}-{}", task.id, Uuid::new_v4()),
                    task_job_payload(task.id, TaskAction::Execute),
                    3,
                )
                .await?;
            return Ok(());
        }
        ctx.task_queue
            .enqueue(
                &format!("review-{}-{}", task.id, Uuid::new_v4()),
                task_job_payload(task.id, TaskAction::Review),
                3,
            )
            .await?;
        return Ok(());
    }

    let children = tasks::list_children(ctx.pool, task.id).await?;
    for child in &children {
        if child.status != TaskStatus::Pending {
            continue;
        }
        let deps_ready = child.child_dependencies.0.iter().all(|dep_title| {
            children
                .iter()
                .any(|sibling| &sibling.title == dep_title && sibling.status == TaskStatus::Done)
        });
        if deps_ready {
            ctx.task_queue
                .enqueue(
                    &format!("decompose-{}", child.id),
                    task_job_payload(child.id, TaskAction::Decompose),
                    3,
                )
                .await?;
        }
    }

    let all_settled = children.iter().all(|c| matches!(c.status, TaskStatus::Done | TaskStatus::Failed));
    if all_settled {
        let any_failed = children.iter().any(|c| c.status == TaskStatus::Failed);
        if any_failed {
            task_machine::transition(ctx.pool, task.id, TaskStatus::Executing, TaskStatus::Failed).await?;
            if !task.external_project_id.is_empty() {
                let _ = ctx
                    .forge_client
                    .move_board_item(&task.external_project_id, &task.external_board_item_id, "Human Review")
                    .await;
            }
        } else {
            task_machine::transition(ctx.pool, task.id, TaskStatus::Executing, TaskStatus::Done).await?;
            if !task.external_project_id.is_empty() {
                let _ = ctx
                    .forge_client
                    .move_board_item(&task.external_project_id, &task.external_board_item_id, "Done")
                    .await;
            }
            let urls: Vec<String> = children.iter().filter_map(|c| c.pr_url.clone()).collect();
            if let Some(issue_number) = task.linked_issue_number {
                let _ = ctx
                    .forge_client
                    .comment_on_issue(
                        &task.repository_full_name,
                        i64::from(issue_number),
                        &format!("All child tasks complete.\n\n{}", urls.join("\n")),
                    )
                    .await;
            }
        }
    } else {
        ctx.task_queue
            .enqueue(
                &format!("check-complete-{}-{}", task.id, Uuid::new_v4()),
                task_job_payload(task.id, TaskAction::Execute),
                3,
            )
            .await?;
    }

    Ok(())
}

async fn do_review(ctx: &TaskProcessorContext<'_>, task: Task) -> Result<()> {
    task_machine::transition(ctx.pool, task.id, TaskStatus::Executing, TaskStatus::Review).await?;

    let config = load_config(ctx, &task).await;
    let repo_root = workspace_repo_root(ctx, task.id).await;
    let branch_name = task
        .branch_name
        .clone()
        .unwrap_or_else(|| render_branch_name(&config.workflow.branch_pattern, task.id, &task.title));
    if let Ok(workspace) = ctx.workspace_manager.prepare(
        task.id,
        &ctx.forge_client.scoped_clone_url(&task.repository_full_name, task.installation_id).await?,
        &ctx.forge_client.default_branch(&task.repository_full_name).await.unwrap_or_else(|_| "main".to_string()),
        &branch_name,
    ) {
        let _ = ctx.workspace_manager.commit_and_push(&workspace, &format!("conductor: {} review", task.title));
    }

    let harness = ctx
        .harness_registry
        .get(ctx.harness_name)
        .with_context(|| format!("unknown harness {:?}", ctx.harness_name))?;

    let action = reviewer::run_review(ctx.pool, &task, &repo_root, ctx.forge_client, harness).await?;

    match action {
        ReviewAction::Approved => {
            if config.workflow.require_smoke_test {
                ctx.task_queue
                    .enqueue(
                        &format!("smoke-test-{}", task.id),
                        task_job_payload(task.id, TaskAction::SmokeTest),
                        3,
                    )
                    .await?;
            } else {
                ctx.task_queue
                    .enqueue(
                        &format!("create-pr-{}", task.id),
                        task_job_payload(task.id, TaskAction::CreatePr),
                        3,
                    )
                    .await?;
            }
            Ok(())
        }
        ReviewAction::ChangesRequested { issues } => {
            let serialized = serde_json::to_string(&issues)?;
            tasks::set_error_message(ctx.pool, task.id, Some(&serialized)).await?;
            task_machine::transition(ctx.pool, task.id, TaskStatus::Review, TaskStatus::Executing).await?;
            let iteration = tasks::count_review_iterations(ctx.pool, task.id).await?;
            ctx.task_queue
                .enqueue(
                    &format!("fix-{}-iter-{}", task.id, iteration),
                    task_job_payload(task.id, TaskAction::Fix),
                    3,
                )
                .await?;
            Ok(())
        }
        ReviewAction::MaxIterationsReached => {
            tasks::set_error_message(ctx.pool, task.id, Some("Code review failed after maximum iterations"))
                .await?;
            task_machine::transition(ctx.pool, task.id, TaskStatus::Review, TaskStatus::Failed).await?;
            Ok(())
        }
    }
}

async fn do_fix(ctx: &TaskProcessorContext<'_>, task: Task) -> Result<()> {
    let issues: Vec<conductor_db::models::ReviewIssue> = task
        .error_message
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();

    let repo_root = workspace_repo_root(ctx, task.id).await;
    let harness = ctx
        .harness_registry
        .get(ctx.harness_name)
        .with_context(|| format!("unknown harness {:?}", ctx.harness_name))?;

    fixer::run_fix(task.id, &issues, &repo_root, harness).await?;

    tasks::set_error_message(ctx.pool, task.id, None).await?;
    ctx.task_queue
        .enqueue(
            &format!("review-{}-{}", task.id, Uuid::new_v4()),
            task_job_payload(task.id, TaskAction::Review),
            3,
        )
        .await?;
    Ok(())
}

async fn do_create_pr(ctx: &TaskProcessorContext<'_>, task: Task) -> Result<()> {
    let branch_name = task
        .branch_name
        .clone()
        .with_context(|| "task has no branch name at create_pr".to_string())?;

    let base_branch = ctx
        .forge_client
        .default_branch(&task.repository_full_name)
        .await
        .unwrap_or_else(|_| "main".to_string());

    if let Ok(workspace) = ctx.workspace_manager.prepare(
        task.id,
        &ctx.forge_client.scoped_clone_url(&task.repository_full_name, task.installation_id).await?,
        &base_branch,
        &branch_name,
    ) {
        let _ = ctx.workspace_manager.commit_and_push(&workspace, &format!("conductor: {} final", task.title));
    }

    let created = ctx
        .forge_client
        .create_pull_request(
            &task.repository_full_name,
            PullRequestCreate {
                title: task.title.clone(),
                body: task.description.clone(),
                head_branch: branch_name.clone(),
                base_branch,
            },
        )
        .await?;

    pull_requests::insert_pull_request(
        ctx.pool,
        task.id,
        &task.repository_full_name,
        i32::try_from(created.number).unwrap_or_default(),
        &task.title,
        &task.description,
        &branch_name,
        "",
        &created.url,
    )
    .await?;
    tasks::set_pull_request(ctx.pool, task.id, i32::try_from(created.number).unwrap_or_default(), &created.url)
        .await?;

    task_machine::transition(ctx.pool, task.id, TaskStatus::Review, TaskStatus::PrCreated).await?;
    if !task.external_project_id.is_empty() {
        let _ = ctx
            .forge_client
            .move_board_item(&task.external_project_id, &task.external_board_item_id, "Human Review")
            .await;
    }
    Ok(())
}

async fn do_smoke_test(ctx: &TaskProcessorContext<'_>, task: Task) -> Result<()> {
    let config = load_config(ctx, &task).await;
    let repo_root = workspace_repo_root(ctx, task.id).await;

    let passed = if let Some(webhook_url) = &config.workflow.smoke_test_webhook {
        let client = reqwest::Client::new();
        let response = client
            .post(webhook_url)
            .json(&serde_json::json!({
                "taskId": task.id,
                "title": task.title,
                "branchName": task.branch_name,
                "repositoryFullName": task.repository_full_name,
            }))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::json!({}));
                body.get("success").and_then(|v| v.as_bool()).unwrap_or(true)
            }
            _ => false,
        }
    } else {
        let touched_subtasks = subtasks::list_subtasks_for_task(ctx.pool, task.id).await?;
        let mut touched_paths: Vec<String> =
            touched_subtasks.iter().map(|s| s.subproject_path.clone()).collect();
        touched_paths.sort();
        touched_paths.dedup();

        let mut all_passed = true;
        for path in &touched_paths {
            let Some(test_command) = config
                .subprojects
                .explicit
                .iter()
                .find(|s| &s.path == path)
                .and_then(|s| s.test_command.clone())
            else {
                continue;
            };
            let dir = if path == "." { repo_root.clone() } else { repo_root.join(path) };
            let result = invariant::run_command(&test_command, &dir, SMOKE_TEST_TIMEOUT).await?;
            if !result.passed {
                all_passed = false;
                break;
            }
        }
        all_passed
    };

    if passed {
        ctx.task_queue
            .enqueue(
                &format!("create-pr-{}", task.id),
                task_job_payload(task.id, TaskAction::CreatePr),
                3,
            )
            .await?;
    } else {
        task_machine::transition(ctx.pool, task.id, TaskStatus::Review, TaskStatus::Failed).await?;
    }
    Ok(())
}
