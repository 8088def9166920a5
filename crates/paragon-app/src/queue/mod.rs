//! Durable Redis job queue for recognition work.
//!
//! One FIFO list (`ocr-jobs`) carries the JSON envelope; dequeued jobs move
//! to an active list until acked, failures are rescheduled through a retry
//! zset with exponential backoff, and exhausted jobs park on a bounded
//! failed list. Delivery is at-least-once; the processor tolerates
//! redeliveries.

use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;

use crate::domain::JobEnvelope;

pub const QUEUE_KEY: &str = "ocr-jobs";
const ACTIVE_KEY: &str = "ocr-jobs:active";
const RETRY_ZSET_KEY: &str = "ocr-jobs:retry";
const ATTEMPTS_HASH_KEY: &str = "ocr-jobs:attempts";
const COMPLETED_KEY: &str = "ocr-jobs:completed";
const FAILED_KEY: &str = "ocr-jobs:failed";

/// Queue-level retry policy: 3 attempts, exponential backoff from 2 s.
pub const MAX_ATTEMPTS: i64 = 3;
const RETRY_BASE_DELAY_SECS: i64 = 2;

/// Retention for finished job artifacts.
const COMPLETED_RETENTION: isize = 100;
const COMPLETED_TTL_SECS: i64 = 86_400;
const FAILED_RETENTION: isize = 1000;

const RETRY_PROMOTION_BATCH: isize = 50;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// A claimed job plus the raw payload needed to ack it.
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    pub envelope: JobEnvelope,
    pub attempt: i64,
    raw: String,
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled for another attempt after the given delay.
    Scheduled { attempt: i64, delay: Duration },
    /// Retries exhausted; parked on the failed list.
    DeadLettered,
}

#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        debug_assert!(envelope.enqueued_at_ms > 0);
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(QUEUE_KEY, payload).await?;
        Ok(())
    }

    /// Jobs currently waiting (not yet claimed by a worker).
    pub async fn waiting_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(QUEUE_KEY).await?)
    }

    /// Claim the next job, blocking up to `timeout`. `None` on idle timeout
    /// or when the payload is unreadable (such payloads are parked).
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<DequeuedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .brpoplpush(QUEUE_KEY, ACTIVE_KEY, timeout.as_secs_f64())
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let envelope: JobEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(error = %err, "unreadable job payload; parking it");
                conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &raw).await?;
                conn.lpush::<_, _, ()>(FAILED_KEY, &raw).await?;
                conn.ltrim::<_, ()>(FAILED_KEY, 0, FAILED_RETENTION - 1).await?;
                return Ok(None);
            }
        };

        let prior_attempts: i64 = conn
            .hget(ATTEMPTS_HASH_KEY, envelope.recognition_id.to_string())
            .await
            .map(|v: Option<i64>| v.unwrap_or(0))?;

        Ok(Some(DequeuedJob {
            envelope,
            attempt: prior_attempts + 1,
            raw,
        }))
    }

    /// Ack a finished job and record its artifact with bounded retention.
    pub async fn complete(&self, job: &DequeuedJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &job.raw).await?;
        conn.lpush::<_, _, ()>(COMPLETED_KEY, &job.raw).await?;
        conn.ltrim::<_, ()>(COMPLETED_KEY, 0, COMPLETED_RETENTION - 1)
            .await?;
        conn.expire::<_, ()>(COMPLETED_KEY, COMPLETED_TTL_SECS).await?;
        conn.hdel::<_, _, ()>(ATTEMPTS_HASH_KEY, job.envelope.recognition_id.to_string())
            .await?;
        Ok(())
    }

    /// Record a failed attempt: either schedule a retry or dead-letter.
    pub async fn fail(&self, job: &DequeuedJob) -> Result<FailureDisposition, QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(ACTIVE_KEY, 1, &job.raw).await?;

        let member = job.envelope.recognition_id.to_string();
        let attempts: i64 = conn.hincr(ATTEMPTS_HASH_KEY, &member, 1).await?;

        if attempts >= MAX_ATTEMPTS {
            conn.lpush::<_, _, ()>(FAILED_KEY, &job.raw).await?;
            conn.ltrim::<_, ()>(FAILED_KEY, 0, FAILED_RETENTION - 1).await?;
            conn.hdel::<_, _, ()>(ATTEMPTS_HASH_KEY, &member).await?;
            return Ok(FailureDisposition::DeadLettered);
        }

        let delay = retry_delay(attempts);
        let retry_at = Utc::now().timestamp() + delay.as_secs() as i64;
        conn.zadd::<_, _, _, ()>(RETRY_ZSET_KEY, &job.raw, retry_at).await?;

        Ok(FailureDisposition::Scheduled {
            attempt: attempts + 1,
            delay,
        })
    }

    /// Move due retries back onto the main queue. Returns how many moved.
    pub async fn promote_due_retries(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(RETRY_ZSET_KEY)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(RETRY_PROMOTION_BATCH)
            .query_async(&mut conn)
            .await?;

        for payload in &due {
            conn.zrem::<_, _, ()>(RETRY_ZSET_KEY, payload).await?;
            conn.lpush::<_, _, ()>(QUEUE_KEY, payload).await?;
        }

        Ok(due.len())
    }
}

/// Exponential backoff for queue-level retries: 2 s, 4 s, ...
fn retry_delay(failed_attempts: i64) -> Duration {
    let exponent = (failed_attempts - 1).clamp(0, 20) as u32;
    Duration::from_secs((RETRY_BASE_DELAY_SECS as u64) << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_from_two_seconds() {
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn retry_delay_tolerates_degenerate_input() {
        assert_eq!(retry_delay(0), Duration::from_secs(2));
        assert_eq!(retry_delay(-5), Duration::from_secs(2));
    }
}
