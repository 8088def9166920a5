//! Client for the receipt alignment service.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bon::Builder;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{EngineError, EngineTransport, ImageAligner};
use crate::domain::AlignmentMode;

const ENGINE_NAME: &str = "aligner";
const ALIGN_PATH: &str = "/api/v1/align";

/// Knobs forwarded to the aligner as query parameters.
#[derive(Debug, Clone, Builder)]
pub struct AlignOptions {
    #[builder(default)]
    pub mode: AlignmentMode,
    #[builder(default = false)]
    pub apply_ocr_prep: bool,
    #[builder(default = false)]
    pub aggressive: bool,
    #[builder(default = 2.0)]
    pub simplify_percent: f64,
}

impl Default for AlignOptions {
    fn default() -> Self {
        AlignOptions::builder().build()
    }
}

/// Geometry-corrected receipt plus its binarized OCR-ready variant.
#[derive(Debug, Clone)]
pub struct AlignedImages {
    pub warped: Vec<u8>,
    pub preprocessed: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct AlignResponse {
    warped: String,
    preprocessed: String,
}

#[derive(Debug, Clone)]
pub struct AlignerClient {
    transport: EngineTransport,
    base_url: String,
}

impl AlignerClient {
    pub fn new(base_url: &str, transport: EngineTransport) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{ALIGN_PATH}", self.base_url)
    }
}

#[async_trait]
impl ImageAligner for AlignerClient {
    async fn align(
        &self,
        image: &[u8],
        opts: &AlignOptions,
    ) -> Result<AlignedImages, EngineError> {
        let query = [
            ("mode", opts.mode.as_ref().to_string()),
            ("aggressive", opts.aggressive.to_string()),
            ("apply_ocr_prep", opts.apply_ocr_prep.to_string()),
            ("simplify_percent", opts.simplify_percent.to_string()),
        ];

        let payload = image.to_vec();
        let response = self
            .transport
            .post_multipart(ENGINE_NAME, &self.endpoint(), &query, || {
                Form::new().part("image", Part::bytes(payload.clone()).file_name("image.jpg"))
            })
            .await?;

        let body: AlignResponse =
            response
                .json()
                .await
                .map_err(|source| EngineError::Decode {
                    engine: ENGINE_NAME,
                    reason: source.to_string(),
                })?;

        let warped = decode_b64(&body.warped)?;
        let preprocessed = decode_b64(&body.preprocessed)?;

        if warped.is_empty() || preprocessed.is_empty() {
            return Err(EngineError::Decode {
                engine: ENGINE_NAME,
                reason: "empty image payload".to_string(),
            });
        }

        Ok(AlignedImages {
            warped,
            preprocessed,
        })
    }
}

fn decode_b64(payload: &str) -> Result<Vec<u8>, EngineError> {
    BASE64_STANDARD
        .decode(payload)
        .map_err(|err| EngineError::Decode {
            engine: ENGINE_NAME,
            reason: format!("invalid base64: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_classic_pipeline() {
        let opts = AlignOptions::default();
        assert_eq!(opts.mode, AlignmentMode::Classic);
        assert!(!opts.apply_ocr_prep);
        assert!(!opts.aggressive);
        assert_eq!(opts.simplify_percent, 2.0);
    }

    #[test]
    fn builder_overrides_mode() {
        let opts = AlignOptions::builder()
            .mode(AlignmentMode::Neural)
            .aggressive(true)
            .build();
        assert_eq!(opts.mode, AlignmentMode::Neural);
        assert!(opts.aggressive);
        assert!(!opts.apply_ocr_prep);
    }

    #[test]
    fn base64_decode_rejects_garbage() {
        assert!(decode_b64("not-base64!!!").is_err());
        assert_eq!(decode_b64("aGk=").expect("valid base64"), b"hi");
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let transport = EngineTransport::new(std::time::Duration::from_secs(1))
            .expect("transport builds");
        let client = AlignerClient::new("http://localhost:8100/", transport);
        assert_eq!(client.endpoint(), "http://localhost:8100/api/v1/align");
    }
}
