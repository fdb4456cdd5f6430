//! The Task state machine: `pending -> decomposing -> executing -> review ->
//! pr_created -> done`, with `human_review` and `failed` as shared detours.

use chrono::Utc;
use conductor_db::models::TaskStatus;
use conductor_db::queries::tasks;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ConductorError;

/// Whether `from -> to` is an edge of the task state graph.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Decomposing)
            | (Pending, Failed)
            | (Decomposing, Executing)
            | (Decomposing, HumanReview)
            | (Decomposing, Failed)
            | (Executing, Review)
            | (Executing, HumanReview)
            | (Executing, Failed)
            | (Review, PrCreated)
            | (Review, Executing)
            | (Review, HumanReview)
            | (Review, Failed)
            | (HumanReview, Decomposing)
            | (HumanReview, Executing)
            | (HumanReview, Failed)
            | (PrCreated, Done)
            | (PrCreated, HumanReview)
            | (PrCreated, Failed)
            | (Failed, Pending)
    )
}

/// The outcome of an attempted transition that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row was updated.
    Applied,
    /// The row's status had already moved on by the time of the update
    /// (optimistic-lock conflict); the caller should treat this as a no-op,
    /// not an error -- another worker already made progress.
    StatusAlreadyChanged,
}

/// Attempt to move a task from `from` to `to`.
///
/// Validates the edge first (an invalid edge is a programmer error,
/// returned as [`ConductorError::InvalidTransition`] without touching the
/// database), then applies an optimistic-locked `UPDATE`. `started_at` is
/// stamped only on the task's first entry to `decomposing`; `completed_at`
/// is stamped on every entry to `done` or `failed`.
pub async fn transition(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<TransitionOutcome, ConductorError> {
    if !is_valid_transition(from, to) {
        return Err(ConductorError::InvalidTransition {
            entity: "task",
            id: task_id,
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    let started_at = matches!(to, TaskStatus::Decomposing).then_some(now);
    let completed_at = matches!(to, TaskStatus::Done | TaskStatus::Failed).then_some(now);

    let rows = tasks::transition_task_status(pool, task_id, from, to, started_at, completed_at)
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
    use TaskStatus::*;

    #[test]
    fn forward_path_is_valid() {
        assert!(is_valid_transition(Pending, Decomposing));
        assert!(is_valid_transition(Decomposing, Executing));
        assert!(is_valid_transition(Executing, Review));
        assert!(is_valid_transition(Review, PrCreated));
        assert!(is_valid_transition(PrCreated, Done));
    }

    #[test]
    fn failed_retries_to_pending() {
        assert!(is_valid_transition(Failed, Pending));
    }

    #[test]
    fn human_review_can_return_to_decomposing_or_executing() {
        assert!(is_valid_transition(HumanReview, Decomposing));
        assert!(is_valid_transition(HumanReview, Executing));
    }

    #[test]
    fn review_loop_back_to_executing_is_valid() {
        assert!(is_valid_transition(Review, Executing));
    }

    #[test]
    fn done_is_terminal() {
        assert!(!is_valid_transition(Done, Pending));
        assert!(!is_valid_transition(Done, Failed));
    }

    #[test]
    fn skipping_states_is_invalid() {
        assert!(!is_valid_transition(Pending, Executing));
        assert!(!is_valid_transition(Pending, Done));
        assert!(!is_valid_transition(Decomposing, PrCreated));
    }

    #[test]
    fn failed_cannot_jump_anywhere_but_pending() {
        assert!(!is_valid_transition(Failed, Executing));
        assert!(!is_valid_transition(Failed, Done));
    }
}
