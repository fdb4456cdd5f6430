//! Integration tests for the task and subtask state machines against a real
//! PostgreSQL database (spun up via testcontainers, one fresh database per
//! test).

use conductor_db::models::{SubtaskStatus, TaskStatus};
use conductor_db::queries::{subtasks, tasks};
use conductor_core::state::task_machine::{self, TransitionOutcome};
use conductor_core::state::{self, subtask_machine};

async fn insert_test_task(pool: &sqlx::PgPool, board_item_id: &str) -> conductor_db::models::Task {
    tasks::insert_task(
        pool,
        board_item_id,
        "project-1",
        "acme/widgets",
        42,
        7,
        "fix the thing",
        "a test task",
    )
    .await
    .expect("failed to insert test task")
}

#[tokio::test]
async fn task_happy_path_transitions() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-1").await;
    assert_eq!(task.status, TaskStatus::Pending);

    let outcome = task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing)
        .await
        .expect("pending -> decomposing should succeed");
    assert_eq!(outcome, TransitionOutcome::Applied);

    let t = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Decomposing);
    assert!(t.started_at.is_some(), "started_at should be stamped on entry to decomposing");

    task_machine::transition(&pool, task.id, TaskStatus::Decomposing, TaskStatus::Executing)
        .await
        .unwrap();
    task_machine::transition(&pool, task.id, TaskStatus::Executing, TaskStatus::Review)
        .await
        .unwrap();
    task_machine::transition(&pool, task.id, TaskStatus::Review, TaskStatus::PrCreated)
        .await
        .unwrap();
    let outcome = task_machine::transition(&pool, task.id, TaskStatus::PrCreated, TaskStatus::Done)
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let t = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Done);
    assert!(t.completed_at.is_some(), "completed_at should be stamped on entry to done");

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn invalid_edge_is_rejected_before_touching_the_row() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-2").await;

    let result = task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Review).await;
    assert!(result.is_err(), "pending -> review skips decomposing/executing, should be rejected");

    let t = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending, "status must be untouched after a rejected transition");

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_lock_yields_status_already_changed_not_an_error() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-3").await;
    task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing)
        .await
        .unwrap();

    // The expected `from` no longer matches -- another worker already moved
    // this task on. This must be a no-op outcome, not an error.
    let outcome = task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing)
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::StatusAlreadyChanged);

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_task_can_retry_back_to_pending_with_incremented_count() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-4").await;
    task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing)
        .await
        .unwrap();
    task_machine::transition(&pool, task.id, TaskStatus::Decomposing, TaskStatus::Failed)
        .await
        .unwrap();

    let rows = tasks::retry_task(&pool, task.id).await.unwrap();
    assert_eq!(rows, 1);

    let t = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);
    assert!(t.error_message.is_none(), "error_message should be cleared on retry");

    // Retrying a non-failed task is a no-op, not an error.
    let rows = tasks::retry_task(&pool, task.id).await.unwrap();
    assert_eq!(rows, 0);

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_transitions_exactly_one_wins() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-5").await;
    task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing)
        .await
        .unwrap();

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let task_id = task.id;
    let a = tokio::spawn(async move {
        task_machine::transition(&pool_a, task_id, TaskStatus::Decomposing, TaskStatus::Executing).await
    });
    let b = tokio::spawn(async move {
        task_machine::transition(&pool_b, task_id, TaskStatus::Decomposing, TaskStatus::HumanReview).await
    });

    let outcome_a = a.await.unwrap().unwrap();
    let outcome_b = b.await.unwrap().unwrap();
    let applied = [outcome_a, outcome_b]
        .iter()
        .filter(|o| **o == TransitionOutcome::Applied)
        .count();
    assert_eq!(applied, 1, "exactly one of two racing transitions should apply");

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn subtask_lifecycle_and_completion_check() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-6").await;
    let a = subtasks::insert_subtask(&pool, task.id, "backend", "do the backend bit", "desc", &[])
        .await
        .unwrap();
    let b = subtasks::insert_subtask(&pool, task.id, "frontend", "do the frontend bit", "desc", &[a.id])
        .await
        .unwrap();

    assert!(!subtask_machine::all_subtasks_complete(&pool, task.id).await.unwrap());

    // b depends on a: only a should be ready.
    let ready = subtasks::get_ready_subtasks(&pool, task.id).await.unwrap();
    let ready_ids: Vec<_> = ready.iter().map(|s| s.id).collect();
    assert!(ready_ids.contains(&a.id));
    assert!(!ready_ids.contains(&b.id));

    subtask_machine::transition(&pool, a.id, SubtaskStatus::Pending, SubtaskStatus::Queued)
        .await
        .unwrap();
    subtask_machine::transition(&pool, a.id, SubtaskStatus::Queued, SubtaskStatus::Running)
        .await
        .unwrap();
    subtask_machine::transition(&pool, a.id, SubtaskStatus::Running, SubtaskStatus::Completed)
        .await
        .unwrap();

    let ready = subtasks::get_ready_subtasks(&pool, task.id).await.unwrap();
    let ready_ids: Vec<_> = ready.iter().map(|s| s.id).collect();
    assert!(ready_ids.contains(&b.id), "b should become ready once a completes");

    subtask_machine::transition(&pool, b.id, SubtaskStatus::Pending, SubtaskStatus::Running)
        .await
        .unwrap();
    subtask_machine::transition(&pool, b.id, SubtaskStatus::Running, SubtaskStatus::Completed)
        .await
        .unwrap();

    assert!(subtask_machine::all_subtasks_complete(&pool, task.id).await.unwrap());

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reset_orphaned_tasks_and_subtasks_on_restart() {
    let (pool, db_name) = conductor_test_utils::create_test_db().await;

    let task = insert_test_task(&pool, "board-item-7").await;
    task_machine::transition(&pool, task.id, TaskStatus::Pending, TaskStatus::Decomposing)
        .await
        .unwrap();
    task_machine::transition(&pool, task.id, TaskStatus::Decomposing, TaskStatus::Executing)
        .await
        .unwrap();

    let sub = subtasks::insert_subtask(&pool, task.id, ".", "in flight", "desc", &[])
        .await
        .unwrap();
    subtask_machine::transition(&pool, sub.id, SubtaskStatus::Pending, SubtaskStatus::Running)
        .await
        .unwrap();

    let reset_tasks = tasks::reset_orphaned_tasks(&pool).await.unwrap();
    assert!(reset_tasks.iter().any(|t| t.id == task.id));
    let reset_subtasks = subtasks::reset_orphaned_subtasks(&pool).await.unwrap();
    assert!(reset_subtasks.iter().any(|s| s.id == sub.id));

    let t = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    let s = subtasks::get_subtask(&pool, sub.id).await.unwrap().unwrap();
    assert_eq!(s.status, SubtaskStatus::Failed);

    conductor_test_utils::drop_test_db(&db_name).await;
}

#[test]
fn is_valid_subtask_transition_matches_the_machine() {
    assert!(state::is_valid_subtask_transition(SubtaskStatus::Pending, SubtaskStatus::Running));
    assert!(!state::is_valid_subtask_transition(SubtaskStatus::Completed, SubtaskStatus::Running));
}
