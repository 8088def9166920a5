//! Worker process: a bounded fleet of executors draining the job queue.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::pipeline::RecognitionProcessor;
use crate::queue::{FailureDisposition, JobQueue, QueueError};

type FleetRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Jobs started per rolling second across the whole fleet.
const FLEET_JOBS_PER_SECOND: u32 = 10;
const DEQUEUE_BLOCK: Duration = Duration::from_secs(1);
const RETRY_PROMOTION_INTERVAL: Duration = Duration::from_secs(1);
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerFleet {
    queue: JobQueue,
    processor: Arc<RecognitionProcessor>,
    concurrency: usize,
}

impl WorkerFleet {
    pub fn new(queue: JobQueue, processor: RecognitionProcessor, concurrency: usize) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            concurrency: concurrency.max(1),
        }
    }

    /// Run executors until `shutdown` flips to true. Executors finish their
    /// in-flight job before exiting.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let quota = Quota::per_second(
            NonZeroU32::new(FLEET_JOBS_PER_SECOND).expect("fleet rate limit is non-zero"),
        );
        let limiter: Arc<FleetRateLimiter> = Arc::new(RateLimiter::direct(quota));

        tracing::info!(
            workers = self.concurrency,
            jobs_per_second = FLEET_JOBS_PER_SECOND,
            "worker fleet starting"
        );

        let mut join_set = JoinSet::new();

        for worker in 0..self.concurrency {
            let queue = self.queue.clone();
            let processor = Arc::clone(&self.processor);
            let limiter = Arc::clone(&limiter);
            let shutdown = shutdown.clone();
            join_set.spawn(executor_loop(worker, queue, processor, limiter, shutdown));
        }

        join_set.spawn(retry_promotion_loop(self.queue.clone(), shutdown.clone()));

        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "worker task aborted");
            }
        }

        tracing::info!("worker fleet stopped");
    }
}

async fn executor_loop(
    worker: usize,
    queue: JobQueue,
    processor: Arc<RecognitionProcessor>,
    limiter: Arc<FleetRateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = tokio::select! {
            _ = shutdown.changed() => continue,
            claimed = claim_next(&queue, &limiter) => claimed,
        };

        match claimed {
            Ok(Some(job)) => {
                let recognition_id = job.envelope.recognition_id;
                tracing::debug!(worker, recognition_id = %recognition_id, attempt = job.attempt, "job claimed");

                match processor.run(&job).await {
                    Ok(()) => {
                        if let Err(err) = queue.complete(&job).await {
                            tracing::warn!(worker, error = %err, recognition_id = %recognition_id, "failed to ack completed job");
                        }
                    }
                    Err(run_err) => match queue.fail(&job).await {
                        Ok(FailureDisposition::Scheduled { attempt, delay }) => {
                            tracing::warn!(
                                worker,
                                recognition_id = %recognition_id,
                                error = %run_err,
                                next_attempt = attempt,
                                delay_secs = delay.as_secs(),
                                "job failed; retry scheduled"
                            );
                        }
                        Ok(FailureDisposition::DeadLettered) => {
                            tracing::error!(
                                worker,
                                recognition_id = %recognition_id,
                                error = %run_err,
                                "job exhausted its retries"
                            );
                        }
                        Err(queue_err) => {
                            tracing::error!(
                                worker,
                                recognition_id = %recognition_id,
                                error = %queue_err,
                                "failed to record job failure"
                            );
                        }
                    },
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(worker, error = %err, "dequeue failed; backing off");
                sleep(QUEUE_ERROR_BACKOFF).await;
            }
        }
    }

    tracing::debug!(worker, "executor stopped");
}

async fn claim_next(
    queue: &JobQueue,
    limiter: &FleetRateLimiter,
) -> Result<Option<crate::queue::DequeuedJob>, QueueError> {
    limiter.until_ready().await;
    queue.dequeue(DEQUEUE_BLOCK).await
}

async fn retry_promotion_loop(queue: JobQueue, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = sleep(RETRY_PROMOTION_INTERVAL) => {}
        }

        match queue.promote_due_retries().await {
            Ok(0) => {}
            Ok(promoted) => tracing::debug!(promoted, "promoted due retries"),
            Err(err) => tracing::warn!(error = %err, "retry promotion failed"),
        }
    }
}
