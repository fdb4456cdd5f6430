//! Webhook Intake: translates board-item changes, pull-request events, and
//! issue-comment commands from the forge into tasks and queue jobs.
//!
//! Signature verification follows the same HMAC-SHA256 / constant-time
//! comparison shape used for scoped agent tokens, applied here to the raw
//! webhook body instead of a bearer token.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::{NotificationChannel, PullRequestStatus, TaskStatus};
use conductor_db::queries::{notifications, pull_requests, tasks};

use crate::forge::SourceForgeClient;
use crate::queue::Queue;
use crate::state::task_machine;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature verification failed")]
    SignatureMismatch,
}

/// Verify a `sha256=<hex>`-style signature header against the raw request
/// body using the shared webhook secret. Constant-time via `verify_slice`.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> Result<(), WebhookError> {
    let hex_mac = signature_header
        .strip_prefix("sha256=")
        .ok_or(WebhookError::MalformedSignature)?;
    let provided = hex::decode(hex_mac).map_err(|_| WebhookError::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| WebhookError::SignatureMismatch)
}

pub struct WebhookContext<'a> {
    pub pool: &'a PgPool,
    pub task_queue: &'a Queue,
    pub notification_queue: &'a Queue,
    pub forge_client: &'a dyn SourceForgeClient,
}

#[derive(Debug, Clone, Deserialize)]
struct BoardItemPayload {
    item_id: String,
    status: String,
    title: String,
    body: String,
    linked_issue_number: Option<i64>,
    repository_full_name: String,
    repository_id: i64,
    installation_id: i64,
    project_id: String,
}

/// Handle a board-item-changed/created event. Ignores anything not landing
/// in the `Todo`/`Redo` columns.
pub async fn handle_board_event(ctx: &WebhookContext<'_>, payload: &Value) -> anyhow::Result<()> {
    let item: BoardItemPayload = serde_json::from_value(payload.clone())?;
    if item.status != "Todo" && item.status != "Redo" {
        return Ok(());
    }

    let existing = tasks::get_task_by_board_item_id(ctx.pool, &item.item_id).await?;

    match existing {
        None if item.status == "Todo" => {
            // TODO: thread item.linked_issue_number onto the new task once
            // insert_task grows a column for it; top-level tasks currently
            // rely on external_board_item_id alone for forge lookups.
            let task = tasks::insert_task(
                ctx.pool,
                &item.item_id,
                &item.project_id,
                &item.repository_full_name,
                item.repository_id,
                item.installation_id,
                &item.title,
                &item.body,
            )
            .await?;
            ctx.task_queue
                .enqueue(&format!("decompose-{}", task.id), task_job_payload(task.id), 3)
                .await?;
        }
        Some(task) if task.status == TaskStatus::HumanReview && item.status == "Todo" => {
            if let Some(issue_number) = task.linked_issue_number {
                if let Ok(Some(answer)) = ctx
                    .forge_client
                    .latest_human_comment(&task.repository_full_name, i64::from(issue_number))
                    .await
                {
                    tasks::set_human_review_answer(ctx.pool, task.id, &answer).await?;
                }
            }
            task_machine::transition(ctx.pool, task.id, TaskStatus::HumanReview, TaskStatus::Pending).await?;
            ctx.task_queue
                .enqueue(&format!("decompose-{}-{}", task.id, Uuid::new_v4()), task_job_payload(task.id), 3)
                .await?;
        }
        Some(task) if task.status == TaskStatus::PrCreated && item.status == "Redo" => {
            if let Some(pr) = pull_requests::get_pull_request_for_task(ctx.pool, task.id).await? {
                if let Ok(feedback) = ctx.forge_client.pull_request_feedback(&task.repository_full_name, i64::from(pr.pr_number)).await {
                    let mut combined = feedback.review_bodies;
                    combined.extend(feedback.issue_comments);
                    tasks::set_human_review_answer(ctx.pool, task.id, &combined.join("\n---\n")).await?;
                }
            }
            task_machine::transition(ctx.pool, task.id, TaskStatus::PrCreated, TaskStatus::Pending).await?;
            ctx.task_queue
                .enqueue(&format!("decompose-{}-{}", task.id, Uuid::new_v4()), task_job_payload(task.id), 3)
                .await?;
        }
        _ => {}
    }

    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct PullRequestEventPayload {
    action: String,
    repository_full_name: String,
    pr_number: i32,
    branch_name: String,
    merged: bool,
    head_sha: Option<String>,
}

/// Handle a pull-request webhook event. Only branches matching
/// `conductor/*` are processed.
pub async fn handle_pull_request_event(ctx: &WebhookContext<'_>, payload: &Value) -> anyhow::Result<()> {
    let event: PullRequestEventPayload = serde_json::from_value(payload.clone())?;
    if !event.branch_name.starts_with("conductor/") {
        return Ok(());
    }

    let pr = pull_requests::get_pull_request_by_number(ctx.pool, &event.repository_full_name, event.pr_number).await?;
    let Some(pr) = pr else {
        return Ok(());
    };

    match event.action.as_str() {
        "closed" if event.merged => {
            pull_requests::update_status(ctx.pool, pr.id, PullRequestStatus::Merged).await?;
            task_machine::transition(ctx.pool, pr.task_id, TaskStatus::PrCreated, TaskStatus::Done).await?;
            let task = tasks::get_task(ctx.pool, pr.task_id).await?;
            if let Some(task) = task {
                if !task.external_project_id.is_empty() {
                    let _ = ctx
                        .forge_client
                        .move_board_item(&task.external_project_id, &task.external_board_item_id, "Done")
                        .await;
                }
            }
        }
        "closed" => {
            pull_requests::update_status(ctx.pool, pr.id, PullRequestStatus::Closed).await?;
        }
        "synchronize" => {
            if let Some(sha) = event.head_sha {
                pull_requests::update_head_commit(ctx.pool, pr.id, &sha).await?;
            }
        }
        _ => {}
    }

    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct IssueCommentPayload {
    repository_full_name: String,
    issue_number: i64,
    comment_body: String,
    author_login: String,
}

const COMMAND_PREFIX: &str = "/conductor ";

/// Handle an issue-comment event. Only comments beginning with
/// `/conductor <command>` produce side effects; everything else is ignored.
/// Returns a reply to post as a new issue comment, if any.
pub async fn handle_issue_comment_event(ctx: &WebhookContext<'_>, payload: &Value) -> anyhow::Result<Option<String>> {
    let event: IssueCommentPayload = serde_json::from_value(payload.clone())?;
    let Some(command) = event.comment_body.trim().strip_prefix(COMMAND_PREFIX) else {
        return Ok(None);
    };
    let command = command.trim();

    let reply = match command.split_whitespace().next().unwrap_or("") {
        "status" => build_status_reply(ctx.pool, &event.repository_full_name).await?,
        "retry" => handle_retry_command(ctx, &event).await?,
        "help" => HELP_TEXT.to_string(),
        other => format!("unknown command: `{other}`. Try `/conductor help`."),
    };

    let _ = event.author_login;
    Ok(Some(reply))
}

const HELP_TEXT: &str = "Available commands:\n\
`/conductor status` - recent task progress\n\
`/conductor retry` - retry the most recent failed task for this issue\n\
`/conductor help` - show this message";

async fn build_status_reply(pool: &PgPool, repository_full_name: &str) -> anyhow::Result<String> {
    let all = tasks::list_tasks(pool).await?;
    let mut rows: Vec<String> = vec!["| task | status | title |".to_string(), "|---|---|---|".to_string()];
    for task in all.iter().filter(|t| t.repository_full_name == repository_full_name).take(10) {
        rows.push(format!("| {} | {} | {} |", short_id(task.id), task.status, task.title));
    }
    if rows.len() == 2 {
        return Ok("No tasks recorded for this repository yet.".to_string());
    }
    Ok(rows.join("\n"))
}

async fn handle_retry_command(ctx: &WebhookContext<'_>, event: &IssueCommentPayload) -> anyhow::Result<String> {
    let all = tasks::list_tasks(ctx.pool).await?;
    let target = all
        .into_iter()
        .filter(|t| t.repository_full_name == event.repository_full_name && t.linked_issue_number == Some(i32::try_from(event.issue_number).unwrap_or_default()))
        .find(|t| t.status == TaskStatus::Failed);

    let Some(task) = target else {
        return Ok("No failed task found for this issue.".to_string());
    };

    let rows_affected = tasks::retry_task(ctx.pool, task.id).await?;
    if rows_affected == 0 {
        return Ok("Task could not be retried (it may have already changed state).".to_string());
    }

    ctx.task_queue
        .enqueue(&format!("decompose-{}-{}", task.id, Uuid::new_v4()), task_job_payload(task.id), 3)
        .await?;
    enqueue_notification(ctx, Some(task.id), "task_retried", serde_json::json!({ "task_id": task.id })).await?;

    Ok(format!("Retrying task `{}`.", short_id(task.id)))
}

async fn enqueue_notification(ctx: &WebhookContext<'_>, task_id: Option<Uuid>, kind: &str, payload: Value) -> anyhow::Result<()> {
    let notification = notifications::insert_notification(ctx.pool, task_id, kind, NotificationChannel::Webhook, payload.clone()).await?;
    ctx.notification_queue
        .enqueue(&format!("notify-{}", notification.id), payload, 3)
        .await?;
    Ok(())
}

fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn task_job_payload(task_id: Uuid) -> Value {
    serde_json::json!({ "task_id": task_id, "action": "decompose" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_hex(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn verifies_matching_signature() {
        let secret = b"webhook-secret";
        let body = br#"{"hello":"world"}"#;
        let header = format!("sha256={}", hmac_hex(secret, body));
        assert!(verify_signature(secret, body, &header).is_ok());
    }

    #[test]
    fn rejects_tampered_body() {
        let secret = b"webhook-secret";
        let body = br#"{"hello":"world"}"#;
        let header = format!("sha256={}", hmac_hex(secret, body));
        assert!(matches!(
            verify_signature(secret, b"{\"hello\":\"tampered\"}", &header),
            Err(WebhookError::SignatureMismatch)
        ));
    }

    #[test]
    fn rejects_missing_prefix() {
        let secret = b"webhook-secret";
        let body = b"x";
        assert!(matches!(
            verify_signature(secret, body, "deadbeef"),
            Err(WebhookError::MalformedSignature)
        ));
    }

    #[test]
    fn rejects_invalid_hex() {
        let secret = b"webhook-secret";
        let body = b"x";
        assert!(matches!(
            verify_signature(secret, body, "sha256=not-hex!"),
            Err(WebhookError::MalformedSignature)
        ));
    }

    #[test]
    fn unknown_command_reply_format() {
        let reply = format!("unknown command: `{}`. Try `/conductor help`.", "bogus");
        assert!(reply.contains("unknown command"));
    }
}
