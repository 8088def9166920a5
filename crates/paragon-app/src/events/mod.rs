//! Lifecycle events published on the `ocr:events` channel.
//!
//! Delivery is best-effort pub/sub: a failed publish is logged and never
//! blocks or reverses a state transition. Every event is emitted only after
//! the matching row has been written, so a received event implies the store
//! already carries the corresponding status.

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{OcrEngine, QrFormat, QrLocation, ResultType};

pub const EVENTS_CHANNEL: &str = "ocr:events";
/// Rough per-job wait used for the queue position estimate.
pub const ESTIMATED_SECONDS_PER_JOB: u64 = 15;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event bus error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Closed union of everything the gateway ever publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum OcrEvent {
    #[serde(rename = "ocr.queued")]
    Queued(QueuedEvent),
    #[serde(rename = "ocr.processing")]
    Processing(ProcessingEvent),
    #[serde(rename = "ocr.completed")]
    Completed(CompletedEvent),
    #[serde(rename = "ocr.failed")]
    Failed(FailedEvent),
}

impl OcrEvent {
    pub fn recognition_id(&self) -> Uuid {
        match self {
            OcrEvent::Queued(e) => e.recognition_id,
            OcrEvent::Processing(e) => e.recognition_id,
            OcrEvent::Completed(e) => e.recognition_id,
            OcrEvent::Failed(e) => e.recognition_id,
        }
    }
}

/// Provenance tags forwarded verbatim from the upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub image_id: Uuid,
    pub recognition_id: Uuid,
    #[serde(flatten)]
    pub provenance: Provenance,
    /// Jobs waiting ahead at publish time.
    pub position: u64,
    /// Seconds, `position × 15`.
    pub estimated_wait: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingEvent {
    pub image_id: Uuid,
    pub recognition_id: Uuid,
    #[serde(flatten)]
    pub provenance: Provenance,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub image_id: Uuid,
    pub recognition_id: Uuid,
    #[serde(flatten)]
    pub provenance: Provenance,
    pub result_type: ResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<QrResult>,
    pub processing_time: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    pub image_id: Uuid,
    pub recognition_id: Uuid,
    #[serde(flatten)]
    pub provenance: Provenance,
    pub error: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextResult {
    pub raw_text: String,
    pub confidence: f64,
    pub engine: OcrEngine,
    pub aligned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrResult {
    pub data: String,
    pub format: QrFormat,
    pub location: QrLocation,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct EventPublisher {
    conn: ConnectionManager,
}

impl EventPublisher {
    pub async fn connect(redis_url: &str) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn publish(&self, event: &OcrEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await?;
        Ok(())
    }

    /// Publish and swallow failures; the state transition already committed.
    pub async fn publish_best_effort(&self, event: &OcrEvent) {
        if let Err(err) = self.publish(event).await {
            tracing::warn!(
                error = %err,
                recognition_id = %event.recognition_id(),
                "failed to publish lifecycle event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance() -> Provenance {
        Provenance {
            source_service: Some("expenses-bot".to_string()),
            source_reference: None,
        }
    }

    #[test]
    fn queued_event_serializes_with_tag_and_camel_case() {
        let event = OcrEvent::Queued(QueuedEvent {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            provenance: provenance(),
            position: 3,
            estimated_wait: 45,
            timestamp: now_ms(),
        });

        let json = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(json["event"], "ocr.queued");
        assert_eq!(json["position"], 3);
        assert_eq!(json["estimatedWait"], 45);
        assert_eq!(json["sourceService"], "expenses-bot");
        assert!(json.get("sourceReference").is_none());
        assert!(json.get("imageId").is_some());
    }

    #[test]
    fn completed_text_event_carries_text_block_only() {
        let event = OcrEvent::Completed(CompletedEvent {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            provenance: Provenance::default(),
            result_type: ResultType::Text,
            text: Some(TextResult {
                raw_text: "ИТОГО 123.45".to_string(),
                confidence: 0.72,
                engine: OcrEngine::Paddleocr,
                aligned: true,
            }),
            qr: None,
            processing_time: 1834,
            timestamp: now_ms(),
        });

        let json = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(json["event"], "ocr.completed");
        assert_eq!(json["resultType"], "text");
        assert_eq!(json["text"]["engine"], "paddleocr");
        assert_eq!(json["text"]["rawText"], "ИТОГО 123.45");
        assert!(json.get("qr").is_none());
        assert_eq!(json["processingTime"], 1834);
    }

    #[test]
    fn completed_qr_event_round_trips() {
        let event = OcrEvent::Completed(CompletedEvent {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            provenance: Provenance::default(),
            result_type: ResultType::Qr,
            text: None,
            qr: Some(QrResult {
                data: "t=20240101T1200&s=123.45&fn=9280440301000000".to_string(),
                format: QrFormat::Fiscal,
                location: QrLocation {
                    x: 10,
                    y: 20,
                    width: 80,
                    height: 80,
                },
            }),
            processing_time: 412,
            timestamp: now_ms(),
        });

        let json = serde_json::to_string(&event).expect("event serializes");
        let back: OcrEvent = serde_json::from_str(&json).expect("event deserializes");
        match back {
            OcrEvent::Completed(e) => {
                let qr = e.qr.expect("qr block present");
                assert_eq!(qr.format, QrFormat::Fiscal);
                assert_eq!(qr.location.width, 80);
            }
            other => panic!("expected completed event, got {other:?}"),
        }
    }

    #[test]
    fn failed_event_serializes_error() {
        let event = OcrEvent::Failed(FailedEvent {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            provenance: Provenance::default(),
            error: "all ocr engines failed".to_string(),
            timestamp: now_ms(),
        });

        let json = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(json["event"], "ocr.failed");
        assert_eq!(json["error"], "all ocr engines failed");
    }
}
