//! HTTP edge for the ingest process.

use std::{future::Future, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query},
    http::{HeaderName, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::domain::{
    AlignmentMode, MAX_IMAGE_BYTES, QrFormat, Recognition, RecognitionStatus, ResultType,
};
use crate::events::{QrResult, TextResult, now_ms};
use crate::ingest::{IngestError, IngestService, UploadRequest};
use crate::storage::{Storage, key_from_locator};

const SERVICE_NAME: &str = "paragon";
const HEALTH_PATH: &str = "/health";
const RECOGNIZE_PATH: &str = "/api/v1/recognize";
const RECOGNITION_PATH: &str = "/api/v1/recognitions/{id}";
const IMAGE_PATH: &str = "/api/v1/images/{id}";
const PRESIGN_TTL: Duration = Duration::from_secs(3600);
// Multipart framing overhead on top of the 10 MiB image cap.
const BODY_LIMIT: usize = MAX_IMAGE_BYTES + 2 * 1024 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_HEADER: &str = "x-request-id";

const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_INTERNAL: &str = "internal_server_error";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
pub struct ApiState {
    pub ingest: IngestService,
    pub storage: Storage,
}

type ApiStateHandle = Arc<ApiState>;

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        self.body.field = Some(field.to_string());
        self
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message)
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(error: IngestError) -> Self {
        if error.is_user_error() {
            return ApiError::invalid_param("image", error.to_string());
        }
        tracing::error!(error = %error, "ingest failed");
        ApiError::internal()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeResponse {
    image_id: Uuid,
    recognition_id: Uuid,
    status: RecognitionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionResponse {
    id: Uuid,
    image_id: Uuid,
    status: RecognitionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_type: Option<ResultType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr: Option<QrResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_wait_time: Option<i64>,
    attempt_number: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl From<Recognition> for RecognitionResponse {
    fn from(record: Recognition) -> Self {
        let text = match (&record.result_type, &record.raw_text) {
            (Some(ResultType::Text), Some(raw_text)) => Some(TextResult {
                raw_text: raw_text.clone(),
                confidence: record.confidence.unwrap_or(0.0),
                engine: record.engine.unwrap_or(crate::domain::OcrEngine::Tesseract),
                aligned: record.aligned.unwrap_or(false),
            }),
            _ => None,
        };
        let qr = match (&record.result_type, &record.qr_data, record.qr_location()) {
            (Some(ResultType::Qr), Some(data), Some(location)) => Some(QrResult {
                data: data.clone(),
                format: record.qr_format.unwrap_or(QrFormat::Unknown),
                location,
            }),
            _ => None,
        };

        RecognitionResponse {
            id: record.id,
            image_id: record.image_id,
            status: record.status,
            result_type: record.result_type,
            text,
            qr,
            processing_time: record.processing_time_ms,
            queue_wait_time: record.queue_wait_time_ms,
            attempt_number: record.attempt_number,
            error: record.error,
            created_at: record.created_at,
            completed_at: record.completed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum ImageVariant {
    Original,
    Processed,
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    #[serde(rename = "type")]
    variant: Option<ImageVariant>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageUrlResponse {
    image_id: Uuid,
    #[serde(rename = "type")]
    variant: ImageVariant,
    url: String,
}

/// Routes that need no state; kept separate so they stay testable without
/// backing services.
pub fn build_health_router() -> Router {
    Router::new().route(HEALTH_PATH, get(health))
}

pub fn build_app_router(state: ApiStateHandle) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<Body>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis() as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        );

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .merge(build_health_router())
        .route(RECOGNIZE_PATH, post(recognize))
        .route(RECOGNITION_PATH, get(recognition_status))
        .route(IMAGE_PATH, get(image_url))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid::default(),
        ))
        .layer(Extension(state))
}

pub async fn serve(
    port: u16,
    state: ApiState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "paragon gateway listening");

    let app = build_app_router(Arc::new(state));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_future(shutdown))
        .await
        .map_err(|source| ServerError::Serve { source })?;

    tracing::info!("gateway shutdown complete");
    Ok(())
}

fn shutdown_future(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> + Send {
    async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
        tracing::info!(
            drain_secs = DRAIN_TIMEOUT.as_secs(),
            "shutdown signal received; draining connections"
        );
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        timestamp: now_ms(),
    })
}

async fn recognize(
    Extension(state): Extension<ApiStateHandle>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut image: Option<(Vec<u8>, String)> = None;
    let mut source_service: Option<String> = None;
    let mut source_reference: Option<String> = None;
    let mut accepted_qr_formats: Option<Vec<QrFormat>> = None;
    let mut alignment_mode: Option<AlignmentMode> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::invalid_param("body", format!("malformed multipart body: {err}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|err| {
                    ApiError::invalid_param("image", format!("failed to read upload: {err}"))
                })?;
                image = Some((data.to_vec(), content_type));
            }
            Some("sourceService") => {
                source_service = non_empty(read_text(field, "sourceService").await?);
            }
            Some("sourceReference") => {
                source_reference = non_empty(read_text(field, "sourceReference").await?);
            }
            Some("acceptedQrFormats") => {
                let raw = read_text(field, "acceptedQrFormats").await?;
                let formats = parse_accepted_formats(&raw)?;
                // A blank field means no filter, not "reject everything".
                accepted_qr_formats = if formats.is_empty() {
                    None
                } else {
                    Some(formats)
                };
            }
            Some("alignmentMode") => {
                let raw = read_text(field, "alignmentMode").await?;
                if let Some(value) = non_empty(raw) {
                    alignment_mode = Some(AlignmentMode::from_str(&value).map_err(|_| {
                        ApiError::invalid_param(
                            "alignmentMode",
                            format!("unknown alignment mode `{value}`"),
                        )
                    })?);
                }
            }
            _ => {}
        }
    }

    let (bytes, mime_type) =
        image.ok_or_else(|| ApiError::invalid_param("image", "image file field is required"))?;

    let accepted = state
        .ingest
        .upload(UploadRequest {
            bytes,
            mime_type,
            source_service,
            source_reference,
            accepted_qr_formats,
            alignment_mode,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RecognizeResponse {
            image_id: accepted.image_id,
            recognition_id: accepted.recognition_id,
            status: RecognitionStatus::Queued,
        }),
    ))
}

async fn recognition_status(
    Extension(state): Extension<ApiStateHandle>,
    Path(id): Path<String>,
) -> Result<Json<RecognitionResponse>, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .storage
        .recognitions
        .find_by_id(id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, recognition_id = %id, "recognition lookup failed");
            ApiError::internal()
        })?
        .ok_or_else(|| ApiError::not_found(format!("recognition `{id}` not found")))?;

    Ok(Json(RecognitionResponse::from(record)))
}

async fn image_url(
    Extension(state): Extension<ApiStateHandle>,
    Path(id): Path<String>,
    Query(query): Query<ImageQuery>,
) -> Result<Json<ImageUrlResponse>, ApiError> {
    let id = parse_id(&id)?;
    let variant = query.variant.unwrap_or(ImageVariant::Original);

    let record = state
        .storage
        .images
        .find_by_id(id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, image_id = %id, "image lookup failed");
            ApiError::internal()
        })?
        .ok_or_else(|| ApiError::not_found(format!("image `{id}` not found")))?;

    let locator = match variant {
        ImageVariant::Original => record.original_url,
        ImageVariant::Processed => record.processed_url.ok_or_else(|| {
            ApiError::not_found(format!("image `{id}` has no processed variant"))
        })?,
    };

    let key = key_from_locator(&locator).ok_or_else(|| {
        tracing::error!(image_id = %id, locator = %locator, "stored locator is unreadable");
        ApiError::internal()
    })?;

    let url = state
        .storage
        .blobs
        .presign(key, PRESIGN_TTL)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, image_id = %id, "presign failed");
            ApiError::internal()
        })?;

    Ok(Json(ImageUrlResponse {
        image_id: id,
        variant,
        url,
    }))
}

async fn read_text(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|err| ApiError::invalid_param(name, format!("failed to read field: {err}")))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::invalid_param("id", format!("invalid id `{raw}`")))
}

/// Parse the comma-separated `acceptedQrFormats` field.
fn parse_accepted_formats(raw: &str) -> Result<Vec<QrFormat>, ApiError> {
    let mut formats = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let format = QrFormat::from_str(trimmed).map_err(|_| {
            ApiError::invalid_param(
                "acceptedQrFormats",
                format!("unknown qr format `{trimmed}`"),
            )
        })?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    Ok(formats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_formats_parse_and_dedupe() {
        let formats = parse_accepted_formats("fiscal,url,fiscal").expect("formats parse");
        assert_eq!(formats, vec![QrFormat::Fiscal, QrFormat::Url]);
    }

    #[test]
    fn accepted_formats_tolerate_whitespace_and_empties() {
        let formats = parse_accepted_formats(" fiscal , ,unknown").expect("formats parse");
        assert_eq!(formats, vec![QrFormat::Fiscal, QrFormat::Unknown]);
    }

    #[test]
    fn unknown_format_is_a_user_error() {
        let err = parse_accepted_formats("fiscal,barcode").expect_err("bad format must fail");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn blank_fields_collapse_to_none() {
        assert_eq!(non_empty("  ".to_string()), None);
        assert_eq!(non_empty(" bot ".to_string()), Some("bot".to_string()));
    }

    #[test]
    fn ids_must_be_uuids() {
        assert!(parse_id("not-a-uuid").is_err());
        assert!(parse_id("4f6c1d0a-3a4e-4f0d-9a5b-6f7c8d9e0a1b").is_ok());
    }
}
