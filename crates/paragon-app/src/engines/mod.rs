//! HTTP clients for the recognition backends.
//!
//! All three engines share one transport policy: per-request timeout, up to
//! three attempts on retryable statuses, exponential backoff capped at ten
//! seconds. The processor talks to them through the `ImageAligner` and
//! `TextRecognizer` seams, so adding an engine means adding a client, not
//! changing control flow.

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::domain::OcrEngine;

pub mod aligner;
pub mod paddle;
pub mod tesseract;
pub mod transport;

pub use aligner::{AlignOptions, AlignedImages, AlignerClient};
pub use paddle::PaddleOcrClient;
pub use tesseract::TesseractClient;
pub use transport::EngineTransport;

/// Statuses worth a fresh upload attempt.
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];

/// Text plus the engine's own certainty about it.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{engine} returned status {status}: {body}")]
    Status {
        engine: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("{engine} request failed: {source}")]
    Transport {
        engine: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{engine} returned an undecodable payload: {reason}")]
    Decode { engine: &'static str, reason: String },
    #[error("failed to build http client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Status { status, .. } => RETRYABLE_STATUSES.contains(&status.as_u16()),
            EngineError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            EngineError::Decode { .. } | EngineError::Client { .. } => false,
        }
    }
}

/// Seam over the OCR engines; the fallback chain holds a list of these.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<OcrOutcome, EngineError>;

    fn engine(&self) -> OcrEngine;
}

/// Seam over the geometry-correcting preprocessor.
#[async_trait]
pub trait ImageAligner: Send + Sync {
    async fn align(&self, image: &[u8], opts: &AlignOptions)
        -> Result<AlignedImages, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_transport_policy() {
        for code in RETRYABLE_STATUSES {
            let err = EngineError::Status {
                engine: "tesseract",
                status: StatusCode::from_u16(code).expect("known status"),
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {code} must be retryable");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for code in [400u16, 401, 403, 404, 422] {
            let err = EngineError::Status {
                engine: "aligner",
                status: StatusCode::from_u16(code).expect("known status"),
                body: String::new(),
            };
            assert!(!err.is_retryable(), "status {code} must surface immediately");
        }
    }

    #[test]
    fn decode_failures_are_terminal() {
        let err = EngineError::Decode {
            engine: "aligner",
            reason: "bad base64".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
