use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::sync::Arc;
use thiserror::Error;

/// Decoded request image, shared read-only between the caption path and
/// both delivery tasks.
pub type SharedImage = Arc<RgbImage>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Image data is empty")]
    Empty,
    #[error("Image data is too large: {0} bytes (max: {1} bytes)")]
    TooLarge(usize, usize),
    #[error("Unsupported image format")]
    UnsupportedFormat,
    #[error("Failed to decode image: {0}")]
    DecodeFailed(image::ImageError),
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(#[from] image::ImageError),
    #[error("Encoding task failed: {0}")]
    TaskFailed(String),
}

pub fn decode_image(bytes: &[u8], max_bytes: usize) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(DecodeError::TooLarge(bytes.len(), max_bytes));
    }

    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnsupportedFormat)?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(DecodeError::DecodeFailed)?;

    Ok(img.to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buf)
}

/// Encodes on the blocking pool so large frames do not stall the runtime.
pub async fn encode_jpeg_blocking(image: SharedImage, quality: u8) -> Result<Bytes, EncodeError> {
    tokio::task::spawn_blocking(move || encode_jpeg(&image, quality))
        .await
        .map_err(|e| EncodeError::TaskFailed(e.to_string()))?
        .map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_pixel(40, 30, Rgba([10, 200, 30, 255]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_decode_png_to_rgb() {
        let img = decode_image(&png_bytes(), 1024 * 1024).unwrap();

        assert_eq!(img.dimensions(), (40, 30));
        assert_eq!(img.get_pixel(0, 0), &Rgb([10, 200, 30]));
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(decode_image(&[], 10), Err(DecodeError::Empty)));
        assert!(matches!(
            decode_image(&png_bytes(), 16),
            Err(DecodeError::TooLarge(_, 16))
        ));
        assert!(matches!(
            decode_image(b"definitely not an image", 1024),
            Err(DecodeError::UnsupportedFormat)
        ));

        let mut truncated = png_bytes();
        truncated.truncate(40);
        assert!(matches!(
            decode_image(&truncated, 1024),
            Err(DecodeError::DecodeFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_encode_jpeg_blocking() {
        let img = Arc::new(RgbImage::from_pixel(16, 16, Rgb([255, 0, 0])));
        let jpeg = encode_jpeg_blocking(img, 90).await.unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }
}
