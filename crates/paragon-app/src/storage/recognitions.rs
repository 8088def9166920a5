//! Repository over the `recognition_results` table.
//!
//! The processor is the only writer after creation, so per-row serialization
//! needs no locking. Every status write is guarded by the state machine:
//! the UPDATE only matches rows whose current status legally admits the
//! target, so an out-of-order write surfaces as an error instead of
//! clobbering a terminal row.

use std::time::Duration;

use sqlx::PgPool;
use strum::IntoEnumIterator;
use uuid::Uuid;

use super::cache::Cache;
use super::{CACHE_TTL, StorageError};
use crate::domain::{OcrEngine, QrFormat, QrLocation, Recognition, RecognitionStatus};

const META_PREFIX: &str = "meta:recognition:";

/// Prior statuses from which the state machine admits `next`.
fn transition_sources(next: RecognitionStatus) -> Vec<RecognitionStatus> {
    RecognitionStatus::iter()
        .filter(|status| status.can_transition_to(next))
        .collect()
}

/// Accepted OCR outcome written on completion.
#[derive(Debug, Clone)]
pub struct TextCompletion {
    pub raw_text: String,
    pub confidence: f64,
    pub engine: OcrEngine,
    pub aligned: bool,
    pub processing_time_ms: i64,
}

/// Decoded QR payload written on completion.
#[derive(Debug, Clone)]
pub struct QrCompletion {
    pub data: String,
    pub format: QrFormat,
    pub location: QrLocation,
    pub processing_time_ms: i64,
}

#[derive(Clone)]
pub struct RecognitionsRepo {
    pool: PgPool,
    cache: Cache,
}

impl RecognitionsRepo {
    pub fn new(pool: PgPool, cache: Cache) -> Self {
        Self { pool, cache }
    }

    pub async fn create(&self, id: Uuid, image_id: Uuid) -> Result<Recognition, StorageError> {
        let record = sqlx::query_as::<_, Recognition>(
            r#"
            INSERT INTO recognition_results (id, image_id, status, attempt_number, created_at)
            VALUES ($1, $2, $3, 1, NOW())
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(image_id)
        .bind(RecognitionStatus::Queued)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Recognition>, StorageError> {
        let cache_key = meta_key(id);
        if let Some(cached) = self.cache.get(&cache_key).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "recognition cache read failed; falling back to store");
            None
        }) {
            if let Ok(record) = serde_json::from_str::<Recognition>(&cached) {
                return Ok(Some(record));
            }
        }

        let record =
            sqlx::query_as::<_, Recognition>("SELECT * FROM recognition_results WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(record) = &record {
            self.cache_projection(&cache_key, record).await;
        }

        Ok(record)
    }

    pub async fn mark_processing(
        &self,
        id: Uuid,
        attempt_number: i32,
        queue_wait_time_ms: i64,
    ) -> Result<Recognition, StorageError> {
        let next = RecognitionStatus::Processing;
        let record = sqlx::query_as::<_, Recognition>(
            r#"
            UPDATE recognition_results
            SET status = $2, attempt_number = $3, queue_wait_time_ms = $4
            WHERE id = $1 AND status = ANY($5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next)
        .bind(attempt_number)
        .bind(queue_wait_time_ms)
        .bind(transition_sources(next))
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Err(self.transition_conflict(id, next).await);
        };

        self.invalidate(id).await;
        Ok(record)
    }

    pub async fn complete_with_text(
        &self,
        id: Uuid,
        completion: TextCompletion,
    ) -> Result<Recognition, StorageError> {
        let next = RecognitionStatus::Completed;
        let record = sqlx::query_as::<_, Recognition>(
            r#"
            UPDATE recognition_results
            SET status = $2, result_type = 'text', raw_text = $3, confidence = $4,
                engine = $5, aligned = $6, processing_time_ms = $7, completed_at = NOW()
            WHERE id = $1 AND status = ANY($8)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next)
        .bind(&completion.raw_text)
        .bind(completion.confidence)
        .bind(completion.engine)
        .bind(completion.aligned)
        .bind(completion.processing_time_ms)
        .bind(transition_sources(next))
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Err(self.transition_conflict(id, next).await);
        };

        self.invalidate(id).await;
        Ok(record)
    }

    pub async fn complete_with_qr(
        &self,
        id: Uuid,
        completion: QrCompletion,
    ) -> Result<Recognition, StorageError> {
        let next = RecognitionStatus::Completed;
        let record = sqlx::query_as::<_, Recognition>(
            r#"
            UPDATE recognition_results
            SET status = $2, result_type = 'qr', qr_data = $3, qr_format = $4,
                qr_x = $5, qr_y = $6, qr_width = $7, qr_height = $8,
                processing_time_ms = $9, completed_at = NOW()
            WHERE id = $1 AND status = ANY($10)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next)
        .bind(&completion.data)
        .bind(completion.format)
        .bind(completion.location.x)
        .bind(completion.location.y)
        .bind(completion.location.width)
        .bind(completion.location.height)
        .bind(completion.processing_time_ms)
        .bind(transition_sources(next))
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Err(self.transition_conflict(id, next).await);
        };

        self.invalidate(id).await;
        Ok(record)
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        processing_time_ms: i64,
    ) -> Result<Recognition, StorageError> {
        let next = RecognitionStatus::Failed;
        let record = sqlx::query_as::<_, Recognition>(
            r#"
            UPDATE recognition_results
            SET status = $2, error = $3, processing_time_ms = $4, completed_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next)
        .bind(error)
        .bind(processing_time_ms)
        .bind(transition_sources(next))
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Err(self.transition_conflict(id, next).await);
        };

        self.invalidate(id).await;
        Ok(record)
    }

    /// Disambiguate a guarded write that matched no row.
    async fn transition_conflict(&self, id: Uuid, next: RecognitionStatus) -> StorageError {
        match sqlx::query_scalar::<_, RecognitionStatus>(
            "SELECT status FROM recognition_results WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(from)) => StorageError::IllegalTransition { id, from, to: next },
            Ok(None) => StorageError::RecognitionNotFound(id),
            Err(err) => StorageError::Database(err),
        }
    }

    async fn cache_projection(&self, key: &str, record: &Recognition) {
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(err) = self
                    .cache
                    .set(key, &json, Some(Duration::from_secs(CACHE_TTL)))
                    .await
                {
                    tracing::warn!(error = %err, "failed to cache recognition projection");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize recognition projection"),
        }
    }

    async fn invalidate(&self, id: Uuid) {
        if let Err(err) = self.cache.delete(&meta_key(id)).await {
            tracing::warn!(
                error = %err,
                recognition_id = %id,
                "failed to invalidate recognition projection"
            );
        }
    }
}

fn meta_key(id: Uuid) -> String {
    format!("{META_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_sources_follow_the_state_machine() {
        assert_eq!(
            transition_sources(RecognitionStatus::Processing),
            vec![RecognitionStatus::Queued]
        );
        assert_eq!(
            transition_sources(RecognitionStatus::Completed),
            vec![RecognitionStatus::Processing]
        );
        assert_eq!(
            transition_sources(RecognitionStatus::Failed),
            vec![RecognitionStatus::Processing]
        );
        assert!(
            transition_sources(RecognitionStatus::Queued).is_empty(),
            "nothing re-enters the queued state"
        );
    }
}
