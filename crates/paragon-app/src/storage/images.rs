//! Repository over the `images` table with a read-through Redis projection.

use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use super::cache::Cache;
use super::{CACHE_TTL, StorageError};
use crate::domain::ImageRecord;

const META_PREFIX: &str = "meta:image:";

/// Fields supplied at ingest; everything else is generated.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub id: Uuid,
    pub original_url: String,
    pub file_size: i64,
    pub mime_type: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub source_service: Option<String>,
    pub source_reference: Option<String>,
}

#[derive(Clone)]
pub struct ImagesRepo {
    pool: PgPool,
    cache: Cache,
}

impl ImagesRepo {
    pub fn new(pool: PgPool, cache: Cache) -> Self {
        Self { pool, cache }
    }

    pub async fn create(&self, image: NewImage) -> Result<ImageRecord, StorageError> {
        let record = sqlx::query_as::<_, ImageRecord>(
            r#"
            INSERT INTO images
                (id, original_url, file_size, mime_type, width, height,
                 source_service, source_reference, uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING *
            "#,
        )
        .bind(image.id)
        .bind(&image.original_url)
        .bind(image.file_size)
        .bind(&image.mime_type)
        .bind(image.width)
        .bind(image.height)
        .bind(&image.source_service)
        .bind(&image.source_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ImageRecord>, StorageError> {
        let cache_key = meta_key(id);
        if let Some(cached) = self.cache.get(&cache_key).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "image cache read failed; falling back to store");
            None
        }) {
            if let Ok(record) = serde_json::from_str::<ImageRecord>(&cached) {
                return Ok(Some(record));
            }
        }

        let record = sqlx::query_as::<_, ImageRecord>("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(record) = &record {
            self.cache_projection(&cache_key, record).await;
        }

        Ok(record)
    }

    /// Set the aligned output locator. Written at most once per image: a
    /// second call is a no-op on the row.
    pub async fn set_processed_url(&self, id: Uuid, url: &str) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE images SET processed_url = $2 WHERE id = $1 AND processed_url IS NULL",
        )
        .bind(id)
        .bind(url)
        .execute(&self.pool)
        .await?;

        self.invalidate(id).await;
        Ok(())
    }

    async fn cache_projection(&self, key: &str, record: &ImageRecord) {
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(err) = self
                    .cache
                    .set(key, &json, Some(Duration::from_secs(CACHE_TTL)))
                    .await
                {
                    tracing::warn!(error = %err, "failed to cache image projection");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize image projection"),
        }
    }

    async fn invalidate(&self, id: Uuid) {
        if let Err(err) = self.cache.delete(&meta_key(id)).await {
            tracing::warn!(error = %err, image_id = %id, "failed to invalidate image projection");
        }
    }
}

fn meta_key(id: Uuid) -> String {
    format!("{META_PREFIX}{id}")
}
