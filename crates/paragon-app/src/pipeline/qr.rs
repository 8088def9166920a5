//! QR decoding and payload classification.

use crate::domain::{QrFormat, QrLocation};

/// One decoded code with its classified payload and pixel bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedQr {
    pub data: String,
    pub format: QrFormat,
    pub location: QrLocation,
}

/// Classify a decoded payload.
///
/// Fiscal receipts carry the tax-authority key set (`fn=`, or `t=` + `s=` +
/// `fp=` together); anything starting with an http(s) scheme is a URL.
pub fn classify_payload(payload: &str) -> QrFormat {
    if payload.contains("fn=")
        || (payload.contains("t=") && payload.contains("s=") && payload.contains("fp="))
    {
        return QrFormat::Fiscal;
    }
    if payload.starts_with("http://") || payload.starts_with("https://") {
        return QrFormat::Url;
    }
    QrFormat::Unknown
}

/// Among codes found in one buffer, prefer a fiscal one, else the first.
pub fn select_preferred(mut codes: Vec<DecodedQr>) -> Option<DecodedQr> {
    if codes.is_empty() {
        return None;
    }
    if let Some(pos) = codes.iter().position(|code| code.format == QrFormat::Fiscal) {
        return Some(codes.swap_remove(pos));
    }
    Some(codes.swap_remove(0))
}

/// Decode every readable code in an image buffer.
pub fn decode_all(buffer: &[u8]) -> Vec<DecodedQr> {
    let Ok(decoded) = image::load_from_memory(buffer) else {
        return Vec::new();
    };

    let mut prepared = rqrr::PreparedImage::prepare(decoded.to_luma8());
    let grids = prepared.detect_grids();

    let mut codes = Vec::new();
    for grid in grids {
        match grid.decode() {
            Ok((_meta, content)) => {
                let location = bounds_to_location(&grid.bounds);
                let format = classify_payload(&content);
                codes.push(DecodedQr {
                    data: content,
                    format,
                    location,
                });
            }
            Err(err) => {
                tracing::debug!(error = %err, "qr grid detected but failed to decode");
            }
        }
    }
    codes
}

/// Scan `warped` first; consult `preprocessed` only when `warped` yields
/// nothing. Codes from the two buffers are never mixed.
pub fn scan_buffers(warped: &[u8], preprocessed: &[u8]) -> Option<DecodedQr> {
    let from_warped = decode_all(warped);
    if !from_warped.is_empty() {
        return select_preferred(from_warped);
    }
    select_preferred(decode_all(preprocessed))
}

fn bounds_to_location(bounds: &[rqrr::Point; 4]) -> QrLocation {
    let xs = bounds.iter().map(|p| p.x);
    let ys = bounds.iter().map(|p| p.y);
    let min_x = xs.clone().min().unwrap_or(0);
    let max_x = xs.max().unwrap_or(0);
    let min_y = ys.clone().min().unwrap_or(0);
    let max_y = ys.max().unwrap_or(0);

    QrLocation {
        x: min_x,
        y: min_y,
        width: (max_x - min_x).max(0),
        height: (max_y - min_y).max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qr(data: &str) -> DecodedQr {
        DecodedQr {
            format: classify_payload(data),
            data: data.to_string(),
            location: QrLocation {
                x: 0,
                y: 0,
                width: 10,
                height: 10,
            },
        }
    }

    #[test]
    fn fiscal_payloads_are_recognized() {
        assert_eq!(
            classify_payload("t=20240101T1200&s=123.45&fn=9280440301000000&i=1&fp=1234567890&n=1"),
            QrFormat::Fiscal
        );
        assert_eq!(classify_payload("fn=9280440301000000"), QrFormat::Fiscal);
        assert_eq!(classify_payload("x=1&fn=2"), QrFormat::Fiscal);
        // The three-key combination qualifies without fn=.
        assert_eq!(
            classify_payload("t=20240101T1200&s=10.00&fp=55500011"),
            QrFormat::Fiscal
        );
    }

    #[test]
    fn urls_are_recognized() {
        assert_eq!(classify_payload("https://example.com/receipt"), QrFormat::Url);
        assert_eq!(classify_payload("http://shop.ru/x"), QrFormat::Url);
    }

    #[test]
    fn fiscal_wins_over_url_shape() {
        // A URL carrying the fiscal key set still classifies fiscal.
        assert_eq!(
            classify_payload("https://check.example?t=1&s=2&fp=3"),
            QrFormat::Fiscal
        );
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(classify_payload("hello world"), QrFormat::Unknown);
        assert_eq!(classify_payload(""), QrFormat::Unknown);
        assert_eq!(classify_payload("t=1&s=2"), QrFormat::Unknown);
    }

    #[test]
    fn selection_prefers_fiscal_within_a_buffer() {
        let codes = vec![qr("https://a.example"), qr("t=1&s=2&fp=3"), qr("plain")];
        let chosen = select_preferred(codes).expect("one code is chosen");
        assert_eq!(chosen.format, QrFormat::Fiscal);
    }

    #[test]
    fn selection_falls_back_to_first_code() {
        let codes = vec![qr("https://a.example"), qr("plain")];
        let chosen = select_preferred(codes).expect("one code is chosen");
        assert_eq!(chosen.data, "https://a.example");
    }

    #[test]
    fn selection_of_empty_set_is_none() {
        assert_eq!(select_preferred(Vec::new()), None);
    }

    #[test]
    fn undecodable_buffer_yields_no_codes() {
        assert!(decode_all(b"not an image").is_empty());
    }

    #[test]
    fn bounds_collapse_to_bounding_box() {
        let bounds = [
            rqrr::Point { x: 40, y: 10 },
            rqrr::Point { x: 120, y: 12 },
            rqrr::Point { x: 118, y: 95 },
            rqrr::Point { x: 38, y: 92 },
        ];
        let location = bounds_to_location(&bounds);
        assert_eq!(location.x, 38);
        assert_eq!(location.y, 10);
        assert_eq!(location.width, 82);
        assert_eq!(location.height, 85);
    }
}
