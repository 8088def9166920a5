//! In-process fallback preprocessing for when the aligner is unreachable.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

/// Binarization cut-off applied after contrast normalization.
const BINARIZE_THRESHOLD: u8 = 128;
const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode preprocessed image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Grayscale → min/max contrast stretch → threshold at 128 → JPEG.
///
/// A rough stand-in for the aligner's binarization pass; geometry is left
/// untouched, so the caller keeps using the original bytes as `warped`.
pub fn binarize_for_ocr(bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
    let decoded = image::load_from_memory(bytes).map_err(PreprocessError::Decode)?;
    let mut gray = decoded.to_luma8();

    let (mut min, mut max) = (u8::MAX, u8::MIN);
    for pixel in gray.pixels() {
        min = min.min(pixel[0]);
        max = max.max(pixel[0]);
    }

    if max > min {
        let range = f32::from(max - min);
        for pixel in gray.pixels_mut() {
            let stretched = f32::from(pixel[0] - min) * 255.0 / range;
            pixel[0] = stretched.round() as u8;
        }
    }

    for pixel in gray.pixels_mut() {
        pixel[0] = if pixel[0] >= BINARIZE_THRESHOLD { 255 } else { 0 };
    }

    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), JPEG_QUALITY);
    gray.write_with_encoder(encoder)
        .map_err(PreprocessError::Encode)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Luma};

    use super::*;

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, _| {
            Luma([((x * 255) / width.max(1)) as u8])
        });
        let mut buffer = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageFormat::Png,
            )
            .expect("png encodes");
        buffer
    }

    #[test]
    fn output_is_jpeg_with_preserved_dimensions() {
        let input = gradient_png(64, 32);
        let output = binarize_for_ocr(&input).expect("preprocessing succeeds");

        let decoded = image::load_from_memory(&output).expect("output decodes");
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 32);
        assert_eq!(
            image::guess_format(&output).expect("format recognized"),
            image::ImageFormat::Jpeg
        );
    }

    #[test]
    fn output_is_binarized() {
        let input = gradient_png(64, 64);
        let output = binarize_for_ocr(&input).expect("preprocessing succeeds");

        let decoded = image::load_from_memory(&output)
            .expect("output decodes")
            .to_luma8();
        // JPEG is lossy; pixels cluster near the two poles instead of
        // hitting them exactly.
        for pixel in decoded.pixels() {
            assert!(
                pixel[0] < 64 || pixel[0] > 192,
                "pixel {} is not near either pole",
                pixel[0]
            );
        }
    }

    #[test]
    fn garbage_input_is_rejected() {
        let result = binarize_for_ocr(b"definitely not an image");
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }
}
