//! The error taxonomy shared across the orchestration engine.

use thiserror::Error;

/// Errors distinguished by how the queue/state machine should react to them.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// The attempted state transition is not an edge of the state graph.
    /// A programmer error; never retried.
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: uuid::Uuid,
        from: String,
        to: String,
    },

    /// A source-forge/network/storage call timed out or returned a 5xx.
    /// Retried by the queue with exponential backoff.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// The Agent Runner killed its child process after the wall-clock cap.
    #[error("agent run {0} exceeded its time limit")]
    AgentTimeout(uuid::Uuid),

    /// The review/fix loop exhausted `maxIterations` without an approval.
    #[error("code review not passed after maximum iterations")]
    ReviewNotPassed,

    /// A board item could not be resolved to a repository; no task created.
    #[error("board item has no resolvable repository: {0}")]
    MissingLink(String),

    /// A webhook delivery's signature did not verify.
    #[error("invalid webhook signature")]
    InvalidSignature,
}
