//! Persistent entities, enums, and the in-flight job envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Upper bound for a single uploaded image.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// MIME types the gateway accepts.
pub const ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// Lifecycle of a recognition. The only legal paths are
/// `queued → processing → completed` and `queued → processing → failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    EnumIter, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(type_name = "status_enum", rename_all = "lowercase")]
pub enum RecognitionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RecognitionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecognitionStatus::Completed | RecognitionStatus::Failed)
    }

    /// Whether moving from `self` to `next` follows the state machine.
    pub fn can_transition_to(self, next: RecognitionStatus) -> bool {
        matches!(
            (self, next),
            (RecognitionStatus::Queued, RecognitionStatus::Processing)
                | (RecognitionStatus::Processing, RecognitionStatus::Completed)
                | (RecognitionStatus::Processing, RecognitionStatus::Failed)
        )
    }
}

/// Shape of a completed recognition result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(type_name = "result_type_enum", rename_all = "lowercase")]
pub enum ResultType {
    Text,
    Qr,
}

/// OCR engines the fallback chain can attribute a result to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(type_name = "engine_enum", rename_all = "lowercase")]
pub enum OcrEngine {
    Tesseract,
    Paddleocr,
}

/// Classification of a decoded QR payload.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(type_name = "qr_format_enum", rename_all = "lowercase")]
pub enum QrFormat {
    Fiscal,
    Url,
    Unknown,
}

/// Aligner operating mode forwarded from the upload form.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlignmentMode {
    #[default]
    Classic,
    Neural,
}

/// Pixel-space location of a decoded QR code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrLocation {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Row in `images`. `original_url` is immutable after creation;
/// `processed_url` is written at most once, by the recognition processor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    pub id: Uuid,
    pub original_url: String,
    pub processed_url: Option<String>,
    pub file_size: i64,
    pub mime_type: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub source_service: Option<String>,
    pub source_reference: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Row in `recognition_results`. Exactly one of the text/QR field families
/// is populated once `status` reaches `completed`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Recognition {
    pub id: Uuid,
    pub image_id: Uuid,
    pub status: RecognitionStatus,
    pub result_type: Option<ResultType>,
    pub raw_text: Option<String>,
    pub confidence: Option<f64>,
    pub engine: Option<OcrEngine>,
    pub aligned: Option<bool>,
    pub qr_data: Option<String>,
    pub qr_format: Option<QrFormat>,
    pub qr_x: Option<i32>,
    pub qr_y: Option<i32>,
    pub qr_width: Option<i32>,
    pub qr_height: Option<i32>,
    pub processing_time_ms: Option<i64>,
    pub queue_wait_time_ms: Option<i64>,
    pub attempt_number: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Recognition {
    pub fn qr_location(&self) -> Option<QrLocation> {
        match (self.qr_x, self.qr_y, self.qr_width, self.qr_height) {
            (Some(x), Some(y), Some(width), Some(height)) => Some(QrLocation {
                x,
                y,
                width,
                height,
            }),
            _ => None,
        }
    }
}

/// Envelope carried on the `ocr-jobs` queue. Read-only after dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub image_id: Uuid,
    pub recognition_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_qr_formats: Option<Vec<QrFormat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_mode: Option<AlignmentMode>,
    pub enqueued_at_ms: i64,
}

impl JobEnvelope {
    /// Whether a QR classified as `format` satisfies the job's filter.
    /// An absent filter accepts everything.
    pub fn accepts_qr(&self, format: QrFormat) -> bool {
        match &self.accepted_qr_formats {
            None => true,
            Some(formats) => formats.contains(&format),
        }
    }
}

/// Map an accepted MIME type to the blob key extension.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Round an engine confidence to the 2-decimal precision the store keeps.
pub fn round_confidence(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_forward_paths() {
        use RecognitionStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(RecognitionStatus::Completed.is_terminal());
        assert!(RecognitionStatus::Failed.is_terminal());
        assert!(!RecognitionStatus::Queued.is_terminal());
        assert!(!RecognitionStatus::Processing.is_terminal());
    }

    #[test]
    fn envelope_round_trips_with_camel_case_fields() {
        let envelope = JobEnvelope {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            source_service: Some("bot".to_string()),
            source_reference: None,
            accepted_qr_formats: Some(vec![QrFormat::Fiscal, QrFormat::Url]),
            alignment_mode: Some(AlignmentMode::Classic),
            enqueued_at_ms: 1_700_000_000_000,
        };

        let json = serde_json::to_value(&envelope).expect("envelope serializes");
        assert!(json.get("imageId").is_some());
        assert!(json.get("recognitionId").is_some());
        assert!(json.get("sourceReference").is_none(), "absent fields are omitted");
        assert_eq!(json["acceptedQrFormats"][0], "fiscal");

        let back: JobEnvelope =
            serde_json::from_value(json).expect("envelope deserializes");
        assert_eq!(back.recognition_id, envelope.recognition_id);
        assert_eq!(back.enqueued_at_ms, envelope.enqueued_at_ms);
    }

    #[test]
    fn envelope_without_filter_accepts_all_formats() {
        let envelope = JobEnvelope {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            source_service: None,
            source_reference: None,
            accepted_qr_formats: None,
            alignment_mode: None,
            enqueued_at_ms: 0,
        };
        assert!(envelope.accepts_qr(QrFormat::Fiscal));
        assert!(envelope.accepts_qr(QrFormat::Unknown));
    }

    #[test]
    fn envelope_filter_rejects_other_formats() {
        let envelope = JobEnvelope {
            image_id: Uuid::new_v4(),
            recognition_id: Uuid::new_v4(),
            source_service: None,
            source_reference: None,
            accepted_qr_formats: Some(vec![QrFormat::Url]),
            alignment_mode: None,
            enqueued_at_ms: 0,
        };
        assert!(envelope.accepts_qr(QrFormat::Url));
        assert!(!envelope.accepts_qr(QrFormat::Fiscal));
    }

    #[test]
    fn confidence_rounds_to_two_decimals() {
        assert_eq!(round_confidence(0.715), 0.72);
        assert_eq!(round_confidence(0.714_9), 0.71);
        assert_eq!(round_confidence(0.0), 0.0);
        assert_eq!(round_confidence(1.0), 1.0);
    }

    #[test]
    fn mime_extensions() {
        assert_eq!(extension_for_mime("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_mime("image/png"), Some("png"));
        assert_eq!(extension_for_mime("image/webp"), Some("webp"));
        assert_eq!(extension_for_mime("application/pdf"), None);
    }
}
