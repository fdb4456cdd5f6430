//! The Subtask state machine: `pending -> queued -> running -> completed`,
//! with `running -> running` permitted for idempotent progress updates and
//! `failed -> pending` as the retry edge.

use conductor_db::models::SubtaskStatus;
use conductor_db::queries::subtasks;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ConductorError;
use crate::state::task_machine::TransitionOutcome;

/// Whether `from -> to` is an edge of the subtask state graph.
pub fn is_valid_transition(from: SubtaskStatus, to: SubtaskStatus) -> bool {
    use SubtaskStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Running)
            | (Pending, Failed)
            | (Queued, Running)
            | (Queued, Failed)
            | (Running, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Pending)
    )
}

/// `areAllSubtasksComplete(task)`: true iff a task has at least one subtask
/// and every subtask has reached `completed`.
pub async fn all_subtasks_complete(pool: &PgPool, task_id: Uuid) -> Result<bool, ConductorError> {
    subtasks::is_task_fully_completed(pool, task_id)
        .await
        .map_err(|e| ConductorError::TransientExternal(e.to_string()))
}

/// Attempt to move a subtask from `from` to `to`.
///
/// Validates the edge first (an invalid edge is a programmer error,
/// returned as [`ConductorError::InvalidTransition`]), then applies an
/// optimistic-locked `UPDATE`. `started_at` is stamped on first entry to
/// `running`; `completed_at` on `completed` or `failed`.
pub async fn transition(
    pool: &PgPool,
    subtask_id: Uuid,
    from: SubtaskStatus,
    to: SubtaskStatus,
) -> Result<TransitionOutcome, ConductorError> {
    if !is_valid_transition(from, to) {
        return Err(ConductorError::InvalidTransition {
            entity: "subtask",
            id: subtask_id,
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let rows = subtasks::transition_subtask_status(pool, subtask_id, from, to)
        .await
        .map_err(|e| ConductorError::TransientExternal(e.to_string()))?;

    if rows == 0 {
        Ok(TransitionOutcome::StatusAlreadyChanged)
    } else {
        Ok(TransitionOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubtaskStatus::*;

    #[test]
    fn forward_path_is_valid() {
        assert!(is_valid_transition(Pending, Queued));
        assert!(is_valid_transition(Queued, Running));
        assert!(is_valid_transition(Running, Completed));
    }

    #[test]
    fn pending_can_skip_straight_to_running() {
        assert!(is_valid_transition(Pending, Running));
    }

    #[test]
    fn running_to_running_is_valid() {
        assert!(is_valid_transition(Running, Running));
    }

    #[test]
    fn failed_retries_to_pending() {
        assert!(is_valid_transition(Failed, Pending));
    }

    #[test]
    fn completed_is_terminal() {
        assert!(!is_valid_transition(Completed, Pending));
        assert!(!is_valid_transition(Completed, Running));
    }

    #[test]
    fn failed_cannot_jump_to_running_directly() {
        assert!(!is_valid_transition(Failed, Running));
        assert!(!is_valid_transition(Failed, Completed));
    }
}
