//! Durable, bounded-concurrency queue consumers.
//!
//! Wraps `conductor_db::queries::queue`'s `FOR UPDATE SKIP LOCKED` claim
//! loop in the same `Arc<Semaphore>` + `mpsc::channel` +
//! `CancellationToken` shape the fleet orchestrator used for its in-process
//! DAG scheduler, generalised here into a standalone named-queue consumer:
//! claim a job, spawn a handler bounded by a semaphore permit, route its
//! outcome back over an mpsc channel, and drain in-flight work for up to
//! ten seconds on cancellation before returning.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use conductor_db::models::QueueJob;
use conductor_db::queries::queue;

/// How a handler finished processing one job.
enum JobOutcome {
    Completed(QueueJob),
    Failed(QueueJob, String),
}

/// Tuning knobs for a single queue's consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum number of jobs processed concurrently from this queue.
    pub concurrency: usize,
    /// How long to sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// How long to wait for in-flight handlers to finish once cancelled.
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Side channel for a running job to report human-readable progress
/// without needing its own durable row -- a board comment handler, for
/// instance, can render the latest value without re-polling the database.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    channels: Arc<Mutex<HashMap<String, watch::Sender<String>>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a progress update for `job_id`, creating its channel if this
    /// is the first update seen for it.
    pub fn update(&self, job_id: &str, message: impl Into<String>) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match channels.get(job_id) {
            Some(tx) => {
                let _ = tx.send(message.into());
            }
            None => {
                let (tx, _rx) = watch::channel(message.into());
                channels.insert(job_id.to_string(), tx);
            }
        }
    }

    /// Subscribe to progress updates for a job, if any have been published.
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<String>> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(job_id).map(|tx| tx.subscribe())
    }

    /// Drop a job's channel once it has finished.
    pub fn clear(&self, job_id: &str) {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).remove(job_id);
    }
}

/// Enqueue helper bound to one named queue.
#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
    name: String,
}

impl Queue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self { pool, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job, deduplicating on `(queue_name, job_id)`.
    pub async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> Result<Option<QueueJob>> {
        Ok(queue::enqueue(&self.pool, &self.name, job_id, payload, max_attempts).await?)
    }
}

/// Run a queue's consumer loop until `cancel` fires, then drain in-flight
/// handlers for up to `config.drain_timeout` before returning.
///
/// `handler` is invoked once per claimed job; its `Ok`/`Err` result decides
/// whether the job is marked `completed` or sent back through
/// `release_for_retry_or_fail`.
pub async fn run_consumer<F, Fut>(
    pool: PgPool,
    queue_name: String,
    config: ConsumerConfig,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(QueueJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<JobOutcome>(config.concurrency.max(1) * 2);
    let mut in_flight: usize = 0;

    loop {
        if cancel.is_cancelled() {
            tracing::info!(queue = %queue_name, "consumer cancelled, draining in-flight jobs");
            let deadline = tokio::time::Instant::now() + config.drain_timeout;
            while in_flight > 0 {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(outcome)) => {
                        in_flight -= 1;
                        apply_outcome(&pool, outcome).await;
                    }
                    _ => break,
                }
            }
            if in_flight > 0 {
                tracing::warn!(queue = %queue_name, remaining = in_flight, "drain timeout expired");
            }
            return;
        }

        while let Ok(outcome) = rx.try_recv() {
            in_flight -= 1;
            apply_outcome(&pool, outcome).await;
        }

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            tokio::select! {
                done = rx.recv() => {
                    if let Some(outcome) = done {
                        in_flight -= 1;
                        apply_outcome(&pool, outcome).await;
                    }
                }
                _ = cancel.cancelled() => continue,
            }
            continue;
        };

        match queue::claim(&pool, &queue_name).await {
            Ok(Some(job)) => {
                in_flight += 1;
                let handler = Arc::clone(&handler);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let job_clone = job.clone();
                    let result = handler(job).await;
                    let outcome = match result {
                        Ok(()) => JobOutcome::Completed(job_clone),
                        Err(e) => JobOutcome::Failed(job_clone, e.to_string()),
                    };
                    let _ = tx.send(outcome).await;
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = cancel.cancelled() => continue,
                }
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(queue = %queue_name, error = %e, "failed to claim job");
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = cancel.cancelled() => continue,
                }
            }
        }
    }
}

async fn apply_outcome(pool: &PgPool, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Completed(job) => {
            if let Err(e) = queue::complete(pool, job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to mark job completed");
            }
        }
        JobOutcome::Failed(job, error) => {
            if let Err(e) = queue::release_for_retry_or_fail(pool, job.id, &error).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to release job for retry");
            }
        }
    }
}
