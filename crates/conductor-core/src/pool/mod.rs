//! Agent Pool: a standalone bounded-concurrency executor for a batch of
//! independent agent runs (e.g. every ready subtask of one task).
//!
//! Extracted from the semaphore/mpsc/progress-callback shape that used to
//! live inline in the fleet orchestrator's main loop, generalised so it can
//! run any batch of named async units of work without a DAG scheduler
//! wrapped around it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("entry with id {0:?} already added to this pool")]
    DuplicateId(String),
}

/// Progress notifications emitted as entries move through the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolProgress {
    Started,
    Finished,
    Skipped,
}

type Work<R> = Pin<Box<dyn Future<Output = Result<R>> + Send>>;

/// A batch of named async units of work, run with bounded concurrency.
pub struct AgentPool<R> {
    max_agents: usize,
    entries: Vec<(String, Work<R>)>,
    cancel: CancellationToken,
}

impl<R: Send + 'static> AgentPool<R> {
    pub fn new(max_agents: usize) -> Self {
        Self {
            max_agents: max_agents.max(1),
            entries: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue a unit of work under `id`. Returns an error if `id` was
    /// already added to this pool.
    pub fn add<F>(&mut self, id: impl Into<String>, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<R>> + Send + 'static,
    {
        let id = id.into();
        if self.entries.iter().any(|(existing, _)| existing == &id) {
            return Err(PoolError::DuplicateId(id));
        }
        self.entries.push((id, Box::pin(work)));
        Ok(())
    }

    /// Cooperatively cancel the pool: pending entries are skipped and
    /// `stop()` signals any already-running entries to wind down (it is up
    /// to the work closures themselves to honour the token).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run every queued entry, bounded by `max_agents` concurrent runs at
    /// once, calling `progress(id, event)` as each entry starts, finishes,
    /// or is skipped due to cancellation. Returns every entry's id mapped
    /// to its outcome.
    pub async fn run_all(
        mut self,
        mut progress: impl FnMut(&str, PoolProgress) + Send,
    ) -> HashMap<String, Result<R>> {
        let semaphore = Arc::new(Semaphore::new(self.max_agents));
        let mut results = HashMap::with_capacity(self.entries.len());
        let mut handles = Vec::with_capacity(self.entries.len());

        for (id, work) in self.entries.drain(..) {
            if self.cancel.is_cancelled() {
                progress(&id, PoolProgress::Skipped);
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    progress(&id, PoolProgress::Skipped);
                    continue;
                }
            };

            progress(&id, PoolProgress::Started);
            let cancel = self.cancel.clone();
            handles.push((
                id,
                tokio::spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        result = work => result,
                        _ = cancel.cancelled() => Err(anyhow::anyhow!("cancelled")),
                    }
                }),
            ));
        }

        for (id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("agent task panicked: {join_err}")),
            };
            progress(&id, PoolProgress::Finished);
            results.insert(id, result);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_all_entries_and_collects_results() {
        let mut pool: AgentPool<i32> = AgentPool::new(2);
        pool.add("a", async { Ok(1) }).unwrap();
        pool.add("b", async { Ok(2) }).unwrap();

        let results = pool.run_all(|_, _| {}).await;
        assert_eq!(*results.get("a").unwrap().as_ref().unwrap(), 1);
        assert_eq!(*results.get("b").unwrap().as_ref().unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let mut pool: AgentPool<i32> = AgentPool::new(2);
        pool.add("a", async { Ok(1) }).unwrap();
        let err = pool.add("a", async { Ok(2) }).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateId(id) if id == "a"));
    }

    #[tokio::test]
    async fn bounds_concurrency_to_max_agents() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut pool: AgentPool<()> = AgentPool::new(2);
        for i in 0..5 {
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            pool.add(i.to_string(), async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        pool.run_all(|_, _| {}).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn stop_skips_entries_not_yet_started() {
        let mut pool: AgentPool<()> = AgentPool::new(1);
        pool.add("a", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .unwrap();
        pool.add("b", async { Ok(()) }).unwrap();

        let cancel = pool.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel.cancel();
        });

        let results = pool.run_all(|_, _| {}).await;
        assert_eq!(results.len(), 1);
    }
}
