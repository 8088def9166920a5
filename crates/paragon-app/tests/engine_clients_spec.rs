use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use paragon_app::domain::OcrEngine;
use paragon_app::engines::{
    AlignOptions, AlignerClient, EngineError, EngineTransport, ImageAligner, PaddleOcrClient,
    TesseractClient, TextRecognizer,
};

fn transport() -> EngineTransport {
    EngineTransport::new(Duration::from_secs(5)).expect("transport builds")
}

#[tokio::test]
async fn aligner_decodes_base64_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/align"))
        .and(query_param("mode", "classic"))
        .and(query_param("apply_ocr_prep", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "warped": BASE64_STANDARD.encode(b"warped-bytes"),
            "preprocessed": BASE64_STANDARD.encode(b"preprocessed-bytes"),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = AlignerClient::new(&server.uri(), transport());
    let aligned = client
        .align(b"receipt photo", &AlignOptions::default())
        .await
        .expect("alignment succeeds");

    assert_eq!(aligned.warped, b"warped-bytes");
    assert_eq!(aligned.preprocessed, b"preprocessed-bytes");
}

#[tokio::test]
async fn aligner_rejects_invalid_base64() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/align"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "warped": "!!! not base64 !!!",
            "preprocessed": "",
        })))
        .mount(&server)
        .await;

    let client = AlignerClient::new(&server.uri(), transport());
    let error = client
        .align(b"receipt photo", &AlignOptions::default())
        .await
        .expect_err("payload must be rejected");

    assert!(matches!(error, EngineError::Decode { .. }));
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let server = MockServer::start().await;

    // The first two attempts see a 503; the third lands.
    Mock::given(method("POST"))
        .and(path("/api/v1/recognize"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/recognize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "ИТОГО 123.45",
            "confidence": 0.87,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = PaddleOcrClient::new(&server.uri(), transport());
    let outcome = client
        .recognize(b"receipt photo")
        .await
        .expect("third attempt succeeds");

    assert_eq!(outcome.text, "ИТОГО 123.45");
    assert_eq!(outcome.confidence, 0.87);
    assert_eq!(client.engine(), OcrEngine::Paddleocr);
}

#[tokio::test]
async fn exhausted_retries_surface_the_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/recognize"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = PaddleOcrClient::new(&server.uri(), transport());
    let error = client
        .recognize(b"receipt photo")
        .await
        .expect_err("all attempts fail");

    match error {
        EngineError::Status { status, .. } => assert_eq!(status.as_u16(), 503),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn non_retryable_statuses_fail_on_the_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/recognize"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid image format"))
        .expect(1)
        .mount(&server)
        .await;

    let client = PaddleOcrClient::new(&server.uri(), transport());
    let error = client
        .recognize(b"not an image")
        .await
        .expect_err("bad request is terminal");

    match error {
        EngineError::Status { status, body, .. } => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("invalid image format"));
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn tesseract_forwards_the_language_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/recognize"))
        .and(query_param("lang", "rus+eng"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Чек №42",
            "confidence": 0.64,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = TesseractClient::new(&server.uri(), "rus+eng", transport());
    let outcome = client
        .recognize(b"receipt photo")
        .await
        .expect("recognition succeeds");

    assert_eq!(outcome.text, "Чек №42");
    assert_eq!(client.engine(), OcrEngine::Tesseract);
}

#[tokio::test]
async fn out_of_range_confidence_is_clamped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/recognize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "x",
            "confidence": 1.7,
        })))
        .mount(&server)
        .await;

    let client = TesseractClient::new(&server.uri(), "rus+eng", transport());
    let outcome = client
        .recognize(b"receipt photo")
        .await
        .expect("recognition succeeds");

    assert_eq!(outcome.confidence, 1.0);
}
