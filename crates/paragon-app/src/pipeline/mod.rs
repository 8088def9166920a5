//! Recognition pipeline: alignment, QR extraction, OCR fallback.

pub mod preprocess;
pub mod processor;
pub mod qr;

pub use preprocess::{PreprocessError, binarize_for_ocr};
pub use processor::{
    AcceptedText, ConfidenceThresholds, OcrAttempt, PipelineError, RecognitionProcessor,
    run_ocr_chain,
};
pub use qr::{DecodedQr, classify_payload, decode_all, scan_buffers};
