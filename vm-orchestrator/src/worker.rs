//! Background execution of provisioning and destroy jobs.
//!
//! Request handlers only enqueue; the [`ProvisioningWorker`] owns the tasks
//! and their lifetime. A periodic sweeper re-enqueues requests left in
//! `approved`, so a full queue or a restart never strands a request.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::pipeline::{Pipeline, ProvisionOutcome};
use crate::request::RequestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Provision { request_id: String },
    Destroy { resource_id: String },
}

/// Sending half of the job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A queue nobody drains. Enqueued jobs are dropped with a warning.
    pub fn detached() -> Self {
        let (queue, _rx) = Self::new(1);
        queue
    }

    /// Enqueue without waiting. Returns whether the job was accepted.
    pub fn enqueue(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(?job, "Job queue full, leaving job for the sweeper");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(?job, "Job queue closed, job dropped");
                false
            }
        }
    }
}

pub struct ProvisioningWorker {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
}

impl ProvisioningWorker {
    pub fn new(pipeline: Arc<Pipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
        }
    }

    /// Drain `jobs` until the queue closes or `shutdown` flips to true, then
    /// wait for in-flight jobs to finish.
    pub fn spawn(
        self,
        mut jobs: mpsc::Receiver<Job>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(self.concurrency));
            let mut running = JoinSet::new();

            info!(concurrency = self.concurrency, "Provisioning worker running");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    job = jobs.recv() => {
                        let Some(job) = job else { break };
                        let permit = match permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let pipeline = Arc::clone(&self.pipeline);
                        running.spawn(async move {
                            let _permit = permit;
                            run_job(&pipeline, job).await;
                        });
                    }
                    Some(finished) = running.join_next(), if !running.is_empty() => {
                        if let Err(e) = finished {
                            error!("Provisioning job panicked: {}", e);
                        }
                    }
                }
            }

            info!(in_flight = running.len(), "Provisioning worker stopping");
            while let Some(finished) = running.join_next().await {
                if let Err(e) = finished {
                    error!("Provisioning job panicked: {}", e);
                }
            }
        })
    }
}

async fn run_job(pipeline: &Pipeline, job: Job) {
    match job {
        Job::Provision { request_id } => match pipeline.provision(&request_id).await {
            Ok(ProvisionOutcome::Skipped) => {
                debug!(request_id = %request_id, "Provisioning already started elsewhere");
            }
            Ok(_) => {}
            Err(e) => error!(request_id = %request_id, "Provisioning job failed: {}", e),
        },
        Job::Destroy { resource_id } => {
            if let Err(e) = pipeline.destroy(&resource_id).await {
                error!(resource_id = %resource_id, "Destroy job failed: {}", e);
            }
        }
    }
}

/// Periodically enqueue every request still waiting in `approved`.
pub async fn start_sweeper_task(
    pool: SqlitePool,
    queue: JobQueue,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = interval(Duration::from_secs(interval_secs.max(1)));

    info!(
        "Sweeper task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match sweep_approved(&pool, &queue).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Sweeper re-enqueued approved requests"),
            Err(e) => error!("Sweeper error: {}", e),
        }
    }
}

/// Enqueue every `approved` request once; returns how many were accepted.
pub async fn sweep_approved(pool: &SqlitePool, queue: &JobQueue) -> Result<usize> {
    let waiting: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM resource_requests WHERE status = ? ORDER BY approved_at, id",
    )
    .bind(RequestStatus::Approved)
    .fetch_all(pool)
    .await?;

    let mut accepted = 0;
    for (request_id,) in waiting {
        if queue.enqueue(Job::Provision { request_id }) {
            accepted += 1;
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_rejects_when_full() {
        let (queue, mut rx) = JobQueue::new(1);
        assert!(queue.enqueue(Job::Provision {
            request_id: "a".into()
        }));
        assert!(!queue.enqueue(Job::Provision {
            request_id: "b".into()
        }));
        assert_eq!(
            rx.recv().await,
            Some(Job::Provision {
                request_id: "a".into()
            })
        );
    }

    #[tokio::test]
    async fn test_detached_queue_drops_jobs() {
        let queue = JobQueue::detached();
        assert!(!queue.enqueue(Job::Destroy {
            resource_id: "r".into()
        }));
    }
}
