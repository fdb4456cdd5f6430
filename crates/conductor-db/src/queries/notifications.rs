//! Database query functions for the `notifications` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Notification, NotificationChannel};

/// Queue a notification for later delivery.
pub async fn insert_notification(
    pool: &PgPool,
    task_id: Option<Uuid>,
    notification_type: &str,
    channel: NotificationChannel,
    payload: serde_json::Value,
) -> Result<Notification> {
    let notification = sqlx::query_as::<_, Notification>(
        "INSERT INTO notifications (task_id, notification_type, channel, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(notification_type)
    .bind(channel)
    .bind(Json(payload))
    .fetch_one(pool)
    .await
    .context("failed to insert notification")?;

    Ok(notification)
}

/// Mark a notification as sent.
pub async fn mark_sent(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE notifications SET sent_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark notification sent")?;

    Ok(result.rows_affected())
}

/// Record a delivery failure on a notification.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE notifications SET error = $1 WHERE id = $2")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark notification failed")?;

    Ok(result.rows_affected())
}

/// List all not-yet-sent notifications, oldest first.
pub async fn list_unsent(pool: &PgPool) -> Result<Vec<Notification>> {
    let notifications = sqlx::query_as::<_, Notification>(
        "SELECT * FROM notifications WHERE sent_at IS NULL ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list unsent notifications")?;

    Ok(notifications)
}
