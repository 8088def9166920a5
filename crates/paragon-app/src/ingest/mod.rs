//! Upload intake: validate, store, seed, enqueue, announce.
//!
//! The flow is deliberately not transactional across the stores; the failure
//! modes (orphan blob, stuck-queued row) are garbage-collectable offline and
//! never corrupt the metadata store.

use std::time::Duration;

use nanoid::nanoid;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    ALLOWED_MIME_TYPES, AlignmentMode, JobEnvelope, MAX_IMAGE_BYTES, QrFormat, extension_for_mime,
};
use crate::events::{
    ESTIMATED_SECONDS_PER_JOB, EventPublisher, OcrEvent, Provenance, QueuedEvent, now_ms,
};
use crate::queue::{JobQueue, QueueError};
use crate::storage::{CACHE_TTL, NewImage, Storage, StorageError, image_bytes_key};

const BLOB_KEY_LEN: usize = 21;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported mime type `{0}`")]
    UnsupportedMime(String),
    #[error("image of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("empty image upload")]
    Empty,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IngestError {
    /// Whether the caller sent something invalid (4xx) rather than the
    /// gateway failing (5xx).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            IngestError::UnsupportedMime(_) | IngestError::TooLarge { .. } | IngestError::Empty
        )
    }
}

/// Validated upload parameters.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub source_service: Option<String>,
    pub source_reference: Option<String>,
    pub accepted_qr_formats: Option<Vec<QrFormat>>,
    pub alignment_mode: Option<AlignmentMode>,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadAccepted {
    pub image_id: Uuid,
    pub recognition_id: Uuid,
}

/// Fail-fast checks, run before any blob or metadata write.
pub fn validate_upload(bytes: &[u8], mime_type: &str) -> Result<(), IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Empty);
    }
    if !ALLOWED_MIME_TYPES.contains(&mime_type) {
        return Err(IngestError::UnsupportedMime(mime_type.to_string()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(IngestError::TooLarge {
            size: bytes.len(),
            max: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct IngestService {
    storage: Storage,
    queue: JobQueue,
    publisher: EventPublisher,
}

impl IngestService {
    pub fn new(storage: Storage, queue: JobQueue, publisher: EventPublisher) -> Self {
        Self {
            storage,
            queue,
            publisher,
        }
    }

    pub async fn upload(&self, request: UploadRequest) -> Result<UploadAccepted, IngestError> {
        debug_assert!(BLOB_KEY_LEN >= 16);
        validate_upload(&request.bytes, &request.mime_type)?;

        let extension = extension_for_mime(&request.mime_type)
            .ok_or_else(|| IngestError::UnsupportedMime(request.mime_type.clone()))?;

        let image_id = Uuid::new_v4();
        let recognition_id = Uuid::new_v4();
        let key = format!("{}-original.{extension}", nanoid!(BLOB_KEY_LEN));

        let original_url = self
            .storage
            .blobs
            .put(&key, request.bytes.clone(), &request.mime_type)
            .await?;

        if let Err(err) = self
            .storage
            .cache
            .set_binary(
                &image_bytes_key(image_id),
                &request.bytes,
                Some(Duration::from_secs(CACHE_TTL)),
            )
            .await
        {
            tracing::warn!(error = %err, image_id = %image_id, "failed to seed upload cache");
        }

        let (width, height) = probe_dimensions(&request.bytes);

        self.storage
            .images
            .create(NewImage {
                id: image_id,
                original_url,
                file_size: request.bytes.len() as i64,
                mime_type: request.mime_type.clone(),
                width,
                height,
                source_service: request.source_service.clone(),
                source_reference: request.source_reference.clone(),
            })
            .await?;
        self.storage
            .recognitions
            .create(recognition_id, image_id)
            .await?;

        let envelope = JobEnvelope {
            image_id,
            recognition_id,
            source_service: request.source_service.clone(),
            source_reference: request.source_reference.clone(),
            accepted_qr_formats: request.accepted_qr_formats.clone(),
            alignment_mode: request.alignment_mode,
            enqueued_at_ms: now_ms(),
        };
        self.queue.enqueue(&envelope).await?;

        let position = match self.queue.waiting_count().await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read queue depth for the queued event");
                0
            }
        };
        self.publisher
            .publish_best_effort(&OcrEvent::Queued(QueuedEvent {
                image_id,
                recognition_id,
                provenance: Provenance {
                    source_service: request.source_service,
                    source_reference: request.source_reference,
                },
                position,
                estimated_wait: position * ESTIMATED_SECONDS_PER_JOB,
                timestamp: now_ms(),
            }))
            .await;

        tracing::info!(
            image_id = %image_id,
            recognition_id = %recognition_id,
            bytes = request.bytes.len(),
            position,
            "upload accepted and queued"
        );

        Ok(UploadAccepted {
            image_id,
            recognition_id,
        })
    }
}

fn probe_dimensions(bytes: &[u8]) -> (Option<i32>, Option<i32>) {
    match image::load_from_memory(bytes) {
        Ok(decoded) => (Some(decoded.width() as i32), Some(decoded.height() as i32)),
        Err(err) => {
            tracing::debug!(error = %err, "could not probe image dimensions");
            (None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_uploads_are_rejected_before_any_write() {
        let err = validate_upload(b"%PDF-1.4", "application/pdf").expect_err("pdf must fail");
        assert!(err.is_user_error());
        assert!(matches!(err, IngestError::UnsupportedMime(_)));
    }

    #[test]
    fn oversized_uploads_are_rejected() {
        let huge = vec![0u8; MAX_IMAGE_BYTES + 1];
        let err = validate_upload(&huge, "image/jpeg").expect_err("oversize must fail");
        assert!(err.is_user_error());
        assert!(matches!(err, IngestError::TooLarge { .. }));
    }

    #[test]
    fn boundary_size_is_accepted() {
        let exact = vec![0u8; MAX_IMAGE_BYTES];
        assert!(validate_upload(&exact, "image/png").is_ok());
    }

    #[test]
    fn empty_uploads_are_rejected() {
        let err = validate_upload(&[], "image/jpeg").expect_err("empty must fail");
        assert!(matches!(err, IngestError::Empty));
    }

    #[test]
    fn all_allowed_mimes_pass() {
        for mime in ALLOWED_MIME_TYPES {
            assert!(validate_upload(&[0u8; 16], mime).is_ok(), "{mime} must pass");
        }
    }

    #[test]
    fn dimension_probe_tolerates_garbage() {
        assert_eq!(probe_dimensions(b"not an image"), (None, None));
    }
}
