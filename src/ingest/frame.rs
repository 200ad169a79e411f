//! Frame validation, normalization and the truncated-frame heuristic.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageFormat, RgbImage};

use super::AcquireError;

/// Codecs a source may deliver
const ACCEPTED_FORMATS: [ImageFormat; 5] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::WebP,
];

/// Raw RGB24 pixels as delivered by the RTSP decoder
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RgbFrame {
    pub const CHANNELS: usize = 3;

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::CHANNELS
    }

    /// Row-variation score of this frame, see [`row_variation`]
    pub fn variation(&self) -> f64 {
        row_variation(&self.pixels, self.width as usize, self.height as usize, Self::CHANNELS)
    }
}

/// Identify the codec of downloaded bytes, rejecting anything unexpected
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, AcquireError> {
    if bytes.is_empty() {
        return Err(AcquireError::Empty);
    }
    let format = image::guess_format(bytes).map_err(|_| AcquireError::UnsupportedFormat(None))?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(AcquireError::UnsupportedFormat(Some(format)));
    }
    Ok(format)
}

/// Decode, resize to `width`x`height` and re-encode as JPEG
pub fn normalize(bytes: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, AcquireError> {
    let format = detect_format(bytes)?;
    let decoded = image::load_from_memory_with_format(bytes, format).map_err(AcquireError::Decode)?;

    let resized = if decoded.width() == width && decoded.height() == height {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Triangle)
    };
    encode_jpeg(&resized.to_rgb8(), quality)
}

/// Encode a raw frame, scaling it first if the decoder delivered another size
pub fn normalize_raw(frame: RgbFrame, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, AcquireError> {
    let (w, h) = (frame.width, frame.height);
    let image = RgbImage::from_raw(w, h, frame.pixels).ok_or(AcquireError::ShortFrame {
        expected: RgbFrame::byte_len(w, h),
    })?;

    if w == width && h == height {
        return encode_jpeg(&image, quality);
    }
    let resized = DynamicImage::ImageRgb8(image).resize_exact(width, height, FilterType::Triangle);
    encode_jpeg(&resized.to_rgb8(), quality)
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, AcquireError> {
    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .map_err(AcquireError::Encode)?;
    Ok(out.into_inner())
}

/// The five rows compared by [`row_variation`]: evenly spaced across the
/// bottom tenth of the frame.
pub fn sample_rows(height: usize) -> [usize; 5] {
    if height == 0 {
        return [0; 5];
    }
    let band = (height / 10).max(1);
    let start = height - band;
    let span = band - 1;
    [0, 1, 2, 3, 4].map(|i| start + i * span / 4)
}

/// Similarity score in `0..=1` from adjacent sampled rows.
///
/// Sum of absolute byte differences between consecutive sampled rows,
/// divided by the largest possible sum. A decoder that stalls mid-transfer
/// smears the last good row down the frame, so a truncated frame scores
/// near zero while a real scene lands around 0.5.
pub fn row_variation(pixels: &[u8], width: usize, height: usize, channels: usize) -> f64 {
    let stride = width * channels;
    if stride == 0 || height == 0 || pixels.len() < stride * height {
        return 0.0;
    }

    let rows = sample_rows(height);
    let row = |r: usize| &pixels[r * stride..(r + 1) * stride];

    let total: u64 = rows
        .windows(2)
        .map(|pair| {
            row(pair[0])
                .iter()
                .zip(row(pair[1]))
                .map(|(a, b)| u64::from(a.abs_diff(*b)))
                .sum::<u64>()
        })
        .sum();

    let max = (rows.len() - 1) as f64 * stride as f64 * 255.0;
    total as f64 / max
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Frame whose sampled rows alternate between 0 and `value`, so its
    /// score is `value / 255`
    pub(crate) fn striped_frame(width: u32, height: u32, value: u8) -> RgbFrame {
        let stride = width as usize * RgbFrame::CHANNELS;
        let mut pixels = vec![0u8; stride * height as usize];
        for (i, r) in sample_rows(height as usize).iter().enumerate() {
            if i % 2 == 1 {
                pixels[r * stride..(r + 1) * stride].fill(value);
            }
        }
        RgbFrame { width, height, pixels }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_sample_rows_in_bottom_tenth() {
        assert_eq!(sample_rows(480), [432, 443, 455, 467, 479]);
        assert_eq!(sample_rows(4), [3, 3, 3, 3, 3]);
    }

    #[test]
    fn test_uniform_frame_scores_zero() {
        let frame = RgbFrame {
            width: 8,
            height: 100,
            pixels: vec![128; RgbFrame::byte_len(8, 100)],
        };
        assert_eq!(frame.variation(), 0.0);
    }

    #[test]
    fn test_striped_frame_score() {
        let frame = striped_frame(16, 200, 255);
        assert!((frame.variation() - 1.0).abs() < 1e-9);

        let frame = striped_frame(16, 200, 51);
        assert!((frame.variation() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_non_image_bytes() {
        assert!(matches!(detect_format(b""), Err(AcquireError::Empty)));
        assert!(matches!(
            detect_format(b"<html>404</html>"),
            Err(AcquireError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_normalize_resizes_to_jpeg() {
        let jpeg = normalize(&png_bytes(64, 48), 32, 24, 80).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn test_normalize_raw_short_buffer() {
        let frame = RgbFrame {
            width: 10,
            height: 10,
            pixels: vec![0; 12],
        };
        assert!(matches!(
            normalize_raw(frame, 10, 10, 85),
            Err(AcquireError::ShortFrame { .. })
        ));
    }
}
