//! Persistence facade: Postgres metadata repos, S3 blob store, Redis cache.
//!
//! Truth lives in Postgres; cache entries are idempotent projections and the
//! blob store holds the actual image bytes.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::RecognitionStatus;

pub mod blob;
pub mod cache;
pub mod images;
pub mod recognitions;

pub use blob::{BlobConfig, BlobStore, key_from_locator};
pub use cache::Cache;
pub use images::{ImagesRepo, NewImage};
pub use recognitions::{QrCompletion, RecognitionsRepo, TextCompletion};

/// TTL for cached metadata projections and cached original bytes.
pub const CACHE_TTL: u64 = 3600;

/// Key under which ingest seeds the original upload for the processor.
pub fn image_bytes_key(image_id: Uuid) -> String {
    format!("image:{image_id}")
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("blob store error: {message}")]
    Blob { message: String },
    #[error("image `{0}` not found")]
    ImageNotFound(Uuid),
    #[error("recognition `{0}` not found")]
    RecognitionNotFound(Uuid),
    #[error("recognition `{id}` cannot transition from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: RecognitionStatus,
        to: RecognitionStatus,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Combined handle the services carry around. Clones share pools.
#[derive(Clone)]
pub struct Storage {
    pub images: ImagesRepo,
    pub recognitions: RecognitionsRepo,
    pub blobs: BlobStore,
    pub cache: Cache,
}

impl Storage {
    pub async fn connect(
        database_url: &str,
        redis_url: &str,
        blob: &BlobConfig,
    ) -> Result<Self, StorageError> {
        let pool: PgPool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        let cache = Cache::connect(redis_url).await?;
        let blobs = BlobStore::new(blob);

        Ok(Self::from_parts(pool, cache, blobs))
    }

    pub fn from_parts(pool: PgPool, cache: Cache, blobs: BlobStore) -> Self {
        Self {
            images: ImagesRepo::new(pool.clone(), cache.clone()),
            recognitions: RecognitionsRepo::new(pool, cache.clone()),
            blobs,
            cache,
        }
    }
}
