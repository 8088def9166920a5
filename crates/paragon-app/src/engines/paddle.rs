//! Client for the PaddleOCR service.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{EngineError, EngineTransport, OcrOutcome, TextRecognizer};
use crate::domain::OcrEngine;

const ENGINE_NAME: &str = "paddleocr";
const RECOGNIZE_PATH: &str = "/api/v1/recognize";

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    text: String,
    confidence: f64,
}

#[derive(Debug, Clone)]
pub struct PaddleOcrClient {
    transport: EngineTransport,
    base_url: String,
}

impl PaddleOcrClient {
    pub fn new(base_url: &str, transport: EngineTransport) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{RECOGNIZE_PATH}", self.base_url)
    }
}

#[async_trait]
impl TextRecognizer for PaddleOcrClient {
    async fn recognize(&self, image: &[u8]) -> Result<OcrOutcome, EngineError> {
        let payload = image.to_vec();

        let response = self
            .transport
            .post_multipart(ENGINE_NAME, &self.endpoint(), &[], || {
                Form::new().part("file", Part::bytes(payload.clone()).file_name("image.jpg"))
            })
            .await?;

        let body: RecognizeResponse =
            response
                .json()
                .await
                .map_err(|source| EngineError::Decode {
                    engine: ENGINE_NAME,
                    reason: source.to_string(),
                })?;

        Ok(OcrOutcome {
            text: body.text,
            confidence: body.confidence.clamp(0.0, 1.0),
        })
    }

    fn engine(&self) -> OcrEngine {
        OcrEngine::Paddleocr
    }
}
