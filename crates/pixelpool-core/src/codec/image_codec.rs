//! Codec backed by the `image` crate.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType as ResizeFilter;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder};

use super::{Codec, CodecError, CodecLoader};
use crate::job::{ConvertJob, ImageFormat};

/// Converts between PNG, JPEG and WebP, resizing on the way when the source
/// exceeds the job's bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl ImageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for ImageCodec {
    fn convert(&self, job: &ConvertJob) -> Result<Vec<u8>, CodecError> {
        let image = image::load_from_memory(&job.input)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let resized = resize_if_needed(image, job.max_width, job.max_height);
        encode(resized, job.target_format, job.quality, job.lossless)
    }
}

/// Loader for [`ImageCodec`]. Loading cannot fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodecLoader;

impl CodecLoader for ImageCodecLoader {
    fn load(&self) -> Result<Box<dyn Codec>, CodecError> {
        Ok(Box::new(ImageCodec::new()))
    }
}

/// Shrink the image to fit the bounds, preserving aspect ratio.
///
/// A bound of 0 leaves that axis unbounded. Images are never enlarged.
fn resize_if_needed(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if max_width == 0 && max_height == 0 {
        return image;
    }

    let (width, height) = image.dimensions();
    let target_width = if max_width == 0 { width } else { max_width };
    let target_height = if max_height == 0 { height } else { max_height };

    if width <= target_width && height <= target_height {
        return image;
    }

    image.resize(target_width, target_height, ResizeFilter::Lanczos3)
}

fn encode(
    image: DynamicImage,
    format: ImageFormat,
    quality: u8,
    lossless: bool,
) -> Result<Vec<u8>, CodecError> {
    let mut output = Vec::new();
    let mut cursor = Cursor::new(&mut output);

    match format {
        ImageFormat::Png => {
            let rgba = image.to_rgba8();
            let encoder =
                PngEncoder::new_with_quality(&mut cursor, CompressionType::Best, FilterType::Adaptive);
            encoder
                .write_image(&rgba, rgba.width(), rgba.height(), ColorType::Rgba8.into())
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        ImageFormat::Jpeg => {
            let rgb = image.to_rgb8();
            let effective_quality = if lossless { 100 } else { quality.clamp(1, 100) };
            let mut encoder = JpegEncoder::new_with_quality(&mut cursor, effective_quality);
            encoder
                .encode(&rgb, rgb.width(), rgb.height(), ColorType::Rgb8.into())
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        ImageFormat::Webp => {
            // The only WebP encoder available is lossless.
            let rgba = image.to_rgba8();
            let encoder = WebPEncoder::new_lossless(&mut cursor);
            encoder
                .encode(&rgba, rgba.width(), rgba.height(), ColorType::Rgba8.into())
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn dimensions_of(bytes: &[u8]) -> (u32, u32) {
        image::load_from_memory(bytes).unwrap().dimensions()
    }

    #[test]
    fn test_png_to_jpeg() {
        let job = ConvertJob::new(sample_png(40, 20), ImageFormat::Jpeg).with_quality(80);
        let output = ImageCodec::new().convert(&job).unwrap();

        assert_eq!(&output[..2], &[0xFF, 0xD8]);
        assert_eq!(dimensions_of(&output), (40, 20));
    }

    #[test]
    fn test_png_to_webp() {
        let job = ConvertJob::new(sample_png(16, 16), ImageFormat::Webp);
        let output = ImageCodec::new().convert(&job).unwrap();

        assert_eq!(&output[..4], b"RIFF");
        assert_eq!(&output[8..12], b"WEBP");
    }

    #[test]
    fn test_downscale_preserves_aspect_ratio() {
        let job = ConvertJob::new(sample_png(40, 20), ImageFormat::Png).with_max_size(10, 0);
        let output = ImageCodec::new().convert(&job).unwrap();

        assert_eq!(dimensions_of(&output), (10, 5));
    }

    #[test]
    fn test_never_upscales() {
        let job = ConvertJob::new(sample_png(40, 20), ImageFormat::Png).with_max_size(400, 400);
        let output = ImageCodec::new().convert(&job).unwrap();

        assert_eq!(dimensions_of(&output), (40, 20));
    }

    #[test]
    fn test_out_of_range_quality_is_clamped() {
        let job = ConvertJob::new(sample_png(8, 8), ImageFormat::Jpeg).with_quality(0);
        assert!(ImageCodec::new().convert(&job).is_ok());
    }

    #[test]
    fn test_lossless_jpeg_is_larger_than_low_quality() {
        let input = sample_png(64, 64);
        let codec = ImageCodec::new();

        let low = codec
            .convert(&ConvertJob::new(input.clone(), ImageFormat::Jpeg).with_quality(10))
            .unwrap();
        let lossless = codec
            .convert(
                &ConvertJob::new(input, ImageFormat::Jpeg)
                    .with_quality(10)
                    .with_lossless(true),
            )
            .unwrap();

        assert!(lossless.len() > low.len());
    }

    #[test]
    fn test_garbage_input_is_decode_error() {
        let job = ConvertJob::new(b"definitely not an image".to_vec(), ImageFormat::Png);
        let err = ImageCodec::new().convert(&job).unwrap_err();

        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_loader_always_succeeds() {
        assert!(ImageCodecLoader.load().is_ok());
    }
}
