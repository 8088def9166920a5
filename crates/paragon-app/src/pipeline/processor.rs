//! The recognition processor: drives one queued job through alignment, QR
//! extraction, the OCR fallback chain, and the terminal status write.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ImageRecord, JobEnvelope, OcrEngine, round_confidence};
use crate::engines::{AlignOptions, ImageAligner, OcrOutcome, TextRecognizer};
use crate::events::{
    CompletedEvent, EventPublisher, FailedEvent, OcrEvent, ProcessingEvent, Provenance, QrResult,
    TextResult, now_ms,
};
use crate::pipeline::preprocess::{self, PreprocessError};
use crate::pipeline::qr;
use crate::queue::DequeuedJob;
use crate::storage::{
    QrCompletion, Storage, StorageError, TextCompletion, image_bytes_key, key_from_locator,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("image `{0}` not found")]
    ImageNotFound(Uuid),
    #[error("recognition `{0}` not found")]
    RecognitionNotFound(Uuid),
    #[error("all ocr engines failed")]
    AllEnginesFailed,
    #[error("image `{id}` carries unreadable blob locator `{locator}`")]
    BadLocator { id: Uuid, locator: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
}

/// Acceptance thresholds for the OCR chain. `low` gates acceptance; `high`
/// is kept as a knob for early exit and is not consulted by the chain today.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceThresholds {
    pub low: f64,
    pub high: f64,
}

/// One planned call in the fallback chain.
pub struct OcrAttempt<'a> {
    pub recognizer: Arc<dyn TextRecognizer>,
    pub buffer: &'a [u8],
    pub buffer_name: &'static str,
}

/// Outcome the chain settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedText {
    pub text: String,
    pub confidence: f64,
    pub engine: OcrEngine,
    /// False when no attempt met the threshold and the last outcome was
    /// used as a low-confidence completion.
    pub met_threshold: bool,
}

/// Run the fallback chain in order. The first outcome at or above
/// `accept_threshold` wins; failed attempts are skips; if nothing qualifies
/// the last produced outcome is returned unmet; `None` means every engine
/// failed outright.
pub async fn run_ocr_chain(
    attempts: &[OcrAttempt<'_>],
    accept_threshold: f64,
) -> Option<AcceptedText> {
    let mut last: Option<(OcrOutcome, OcrEngine)> = None;

    for attempt in attempts {
        let engine = attempt.recognizer.engine();
        match attempt.recognizer.recognize(attempt.buffer).await {
            Ok(outcome) => {
                tracing::debug!(
                    engine = %engine,
                    buffer = attempt.buffer_name,
                    confidence = outcome.confidence,
                    "ocr attempt produced a result"
                );
                if outcome.confidence >= accept_threshold {
                    return Some(AcceptedText {
                        text: outcome.text,
                        confidence: outcome.confidence,
                        engine,
                        met_threshold: true,
                    });
                }
                last = Some((outcome, engine));
            }
            Err(err) => {
                tracing::warn!(
                    engine = %engine,
                    buffer = attempt.buffer_name,
                    error = %err,
                    "ocr attempt failed; moving to the next engine"
                );
            }
        }
    }

    last.map(|(outcome, engine)| AcceptedText {
        text: outcome.text,
        confidence: outcome.confidence,
        engine,
        met_threshold: false,
    })
}

pub struct RecognitionProcessor {
    storage: Storage,
    publisher: EventPublisher,
    aligner: Arc<dyn ImageAligner>,
    tesseract: Arc<dyn TextRecognizer>,
    paddle: Arc<dyn TextRecognizer>,
    thresholds: ConfidenceThresholds,
}

impl RecognitionProcessor {
    pub fn new(
        storage: Storage,
        publisher: EventPublisher,
        aligner: Arc<dyn ImageAligner>,
        tesseract: Arc<dyn TextRecognizer>,
        paddle: Arc<dyn TextRecognizer>,
        thresholds: ConfidenceThresholds,
    ) -> Self {
        Self {
            storage,
            publisher,
            aligner,
            tesseract,
            paddle,
            thresholds,
        }
    }

    /// Drive one job to a terminal state. An `Err` means the terminal state
    /// is `failed` (already written and published); it is re-raised so the
    /// queue can schedule a retry.
    pub async fn run(&self, job: &DequeuedJob) -> Result<(), PipelineError> {
        debug_assert!(self.thresholds.low <= self.thresholds.high);
        debug_assert!(job.attempt >= 1);

        let started = Instant::now();
        let envelope = &job.envelope;
        let recognition_id = envelope.recognition_id;

        // At-least-once delivery: a redelivered job whose row already
        // reached a terminal state is acked untouched, keeping persisted
        // statuses strictly monotonic.
        match self.storage.recognitions.find_by_id(recognition_id).await? {
            Some(existing) if existing.status.is_terminal() => {
                tracing::info!(
                    recognition_id = %recognition_id,
                    status = %existing.status,
                    "job redelivered after terminal write; acking without changes"
                );
                return Ok(());
            }
            Some(_) => {}
            None => return Err(PipelineError::RecognitionNotFound(recognition_id)),
        }

        let queue_wait_ms = (now_ms() - envelope.enqueued_at_ms).max(0);
        self.storage
            .recognitions
            .mark_processing(recognition_id, job.attempt as i32, queue_wait_ms)
            .await?;
        self.publisher
            .publish_best_effort(&OcrEvent::Processing(ProcessingEvent {
                image_id: envelope.image_id,
                recognition_id,
                provenance: provenance(envelope),
                timestamp: now_ms(),
            }))
            .await;

        match self.execute(envelope, started).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let processing_ms = started.elapsed().as_millis() as i64;
                let message = err.to_string();
                match self
                    .storage
                    .recognitions
                    .mark_failed(recognition_id, &message, processing_ms)
                    .await
                {
                    Ok(_) => {
                        self.publisher
                            .publish_best_effort(&OcrEvent::Failed(FailedEvent {
                                image_id: envelope.image_id,
                                recognition_id,
                                provenance: provenance(envelope),
                                error: message,
                                timestamp: now_ms(),
                            }))
                            .await;
                    }
                    Err(write_err) => {
                        tracing::error!(
                            recognition_id = %recognition_id,
                            error = %write_err,
                            "failed to record terminal failure"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, envelope: &JobEnvelope, started: Instant) -> Result<(), PipelineError> {
        let image = self
            .storage
            .images
            .find_by_id(envelope.image_id)
            .await?
            .ok_or(PipelineError::ImageNotFound(envelope.image_id))?;

        let original = self.load_original(&image).await?;
        let (warped, preprocessed) = self.align_or_degrade(&image, &original, envelope).await?;

        if let Some(code) = qr::scan_buffers(&warped, &preprocessed) {
            if envelope.accepts_qr(code.format) {
                let processing_ms = started.elapsed().as_millis() as i64;
                self.storage
                    .recognitions
                    .complete_with_qr(
                        envelope.recognition_id,
                        QrCompletion {
                            data: code.data.clone(),
                            format: code.format,
                            location: code.location,
                            processing_time_ms: processing_ms,
                        },
                    )
                    .await?;
                self.publisher
                    .publish_best_effort(&OcrEvent::Completed(CompletedEvent {
                        image_id: envelope.image_id,
                        recognition_id: envelope.recognition_id,
                        provenance: provenance(envelope),
                        result_type: crate::domain::ResultType::Qr,
                        text: None,
                        qr: Some(QrResult {
                            data: code.data,
                            format: code.format,
                            location: code.location,
                        }),
                        processing_time: processing_ms,
                        timestamp: now_ms(),
                    }))
                    .await;
                return Ok(());
            }
            tracing::debug!(
                recognition_id = %envelope.recognition_id,
                format = %code.format,
                "qr decoded but not in the accepted format set; falling back to ocr"
            );
        }

        let attempts = [
            OcrAttempt {
                recognizer: Arc::clone(&self.tesseract),
                buffer: &preprocessed,
                buffer_name: "preprocessed",
            },
            OcrAttempt {
                recognizer: Arc::clone(&self.paddle),
                buffer: &preprocessed,
                buffer_name: "preprocessed",
            },
            OcrAttempt {
                recognizer: Arc::clone(&self.paddle),
                buffer: &warped,
                buffer_name: "warped",
            },
        ];

        let accepted = run_ocr_chain(&attempts, self.thresholds.low)
            .await
            .ok_or(PipelineError::AllEnginesFailed)?;

        if !accepted.met_threshold {
            tracing::info!(
                recognition_id = %envelope.recognition_id,
                confidence = accepted.confidence,
                "no attempt met the threshold; completing with the last result"
            );
        }

        let confidence = round_confidence(accepted.confidence);
        let processing_ms = started.elapsed().as_millis() as i64;
        self.storage
            .recognitions
            .complete_with_text(
                envelope.recognition_id,
                TextCompletion {
                    raw_text: accepted.text.clone(),
                    confidence,
                    engine: accepted.engine,
                    aligned: true,
                    processing_time_ms: processing_ms,
                },
            )
            .await?;
        self.publisher
            .publish_best_effort(&OcrEvent::Completed(CompletedEvent {
                image_id: envelope.image_id,
                recognition_id: envelope.recognition_id,
                provenance: provenance(envelope),
                result_type: crate::domain::ResultType::Text,
                text: Some(TextResult {
                    raw_text: accepted.text,
                    confidence,
                    engine: accepted.engine,
                    aligned: true,
                }),
                qr: None,
                processing_time: processing_ms,
                timestamp: now_ms(),
            }))
            .await;

        Ok(())
    }

    /// Original bytes: cache first, blob store on a miss.
    async fn load_original(&self, image: &ImageRecord) -> Result<Vec<u8>, PipelineError> {
        let cache_key = image_bytes_key(image.id);
        match self.storage.cache.get_binary(&cache_key).await {
            Ok(Some(bytes)) if !bytes.is_empty() => return Ok(bytes),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, image_id = %image.id, "cache read failed; using blob store");
            }
        }

        let key = key_from_locator(&image.original_url).ok_or_else(|| PipelineError::BadLocator {
            id: image.id,
            locator: image.original_url.clone(),
        })?;
        Ok(self.storage.blobs.get(key).await?)
    }

    /// Remote alignment, degrading to the original bytes plus a locally
    /// binarized variant when the aligner is unreachable. Only the remote
    /// path persists a processed blob.
    async fn align_or_degrade(
        &self,
        image: &ImageRecord,
        original: &[u8],
        envelope: &JobEnvelope,
    ) -> Result<(Vec<u8>, Vec<u8>), PipelineError> {
        let opts = AlignOptions::builder()
            .mode(envelope.alignment_mode.unwrap_or_default())
            .build();

        match self.aligner.align(original, &opts).await {
            Ok(aligned) => {
                let key = format!("{}-processed.jpg", image.id);
                let url = self
                    .storage
                    .blobs
                    .put(&key, aligned.warped.clone(), "image/jpeg")
                    .await?;
                self.storage.images.set_processed_url(image.id, &url).await?;
                Ok((aligned.warped, aligned.preprocessed))
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    image_id = %image.id,
                    "alignment failed; degrading to local preprocessing"
                );
                let preprocessed = preprocess::binarize_for_ocr(original)?;
                Ok((original.to_vec(), preprocessed))
            }
        }
    }
}

fn provenance(envelope: &JobEnvelope) -> Provenance {
    Provenance {
        source_service: envelope.source_service.clone(),
        source_reference: envelope.source_reference.clone(),
    }
}
