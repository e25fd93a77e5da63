//! Transformation pipeline: decode, resize, re-encode
//!
//! Resizing follows cover semantics when both axes are given and never
//! enlarges beyond the source dimensions.

use crate::error::{ImageCacheError, Result};
use crate::types::{ImageFormat, TransformOptions};
use async_trait::async_trait;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::debug;

/// AVIF encoder speed (1 slowest .. 10 fastest)
const AVIF_SPEED: u8 = 8;

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, bytes: Vec<u8>, options: &TransformOptions) -> Result<Vec<u8>>;
}

/// What to do with a source of a given size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePlan {
    Keep,
    /// Proportional scale to exact dimensions
    Scale(u32, u32),
    /// Scale to cover then centre-crop
    Fill(u32, u32),
}

/// Decide the resize for a source of `src_w` x `src_h`
pub fn plan_resize(src_w: u32, src_h: u32, width: Option<u32>, height: Option<u32>) -> ResizePlan {
    match (width, height) {
        (None, None) => ResizePlan::Keep,
        (Some(w), Some(h)) => {
            if w >= src_w && h >= src_h {
                return ResizePlan::Keep;
            }
            let (w, h) = (w.min(src_w), h.min(src_h));
            if (w, h) == (src_w, src_h) {
                ResizePlan::Keep
            } else {
                ResizePlan::Fill(w, h)
            }
        }
        (Some(w), None) => {
            if w >= src_w {
                return ResizePlan::Keep;
            }
            ResizePlan::Scale(w, scale_axis(src_h, w, src_w))
        }
        (None, Some(h)) => {
            if h >= src_h {
                return ResizePlan::Keep;
            }
            ResizePlan::Scale(scale_axis(src_w, h, src_h), h)
        }
    }
}

fn scale_axis(other: u32, target: u32, source: u32) -> u32 {
    let scaled = (u64::from(other) * u64::from(target) + u64::from(source) / 2) / u64::from(source);
    scaled.max(1) as u32
}

/// Pipeline backed by the `image` crate. Work runs on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTransformer;

impl ImageTransformer {
    pub fn new() -> Self {
        Self
    }

    fn run(bytes: &[u8], options: &TransformOptions) -> Result<Vec<u8>> {
        let source = image::load_from_memory(bytes)?;
        let plan = plan_resize(source.width(), source.height(), options.width, options.height);
        let resized = match plan {
            ResizePlan::Keep => source,
            ResizePlan::Scale(w, h) => source.resize_exact(w, h, FilterType::Lanczos3),
            ResizePlan::Fill(w, h) => source.resize_to_fill(w, h, FilterType::Lanczos3),
        };
        debug!(?plan, width = resized.width(), height = resized.height(), "Resized image");
        encode(&resized, options.format, options.quality)
    }
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
        }
        ImageFormat::Webp => {
            // The pure-Rust encoder is lossless only; quality still keys the entry
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
        }
        ImageFormat::Avif => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(AvifEncoder::new_with_speed_quality(
                &mut buf,
                AVIF_SPEED,
                quality,
            ))?;
        }
        ImageFormat::Png => {
            let compression = if quality < 50 {
                CompressionType::Best
            } else {
                CompressionType::Default
            };
            img.write_with_encoder(PngEncoder::new_with_quality(
                &mut buf,
                compression,
                PngFilter::Adaptive,
            ))?;
        }
    }
    Ok(buf)
}

#[async_trait]
impl Transformer for ImageTransformer {
    async fn transform(&self, bytes: Vec<u8>, options: &TransformOptions) -> Result<Vec<u8>> {
        let options = *options;
        tokio::task::spawn_blocking(move || Self::run(&bytes, &options))
            .await
            .map_err(|e| ImageCacheError::TransformationFailed(format!("worker panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat as Codec, RgbImage};
    use std::io::Cursor;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, Codec::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_plan_without_dimensions_keeps_source() {
        assert_eq!(plan_resize(800, 600, None, None), ResizePlan::Keep);
    }

    #[test]
    fn test_plan_single_axis_preserves_aspect() {
        assert_eq!(
            plan_resize(800, 600, Some(400), None),
            ResizePlan::Scale(400, 300)
        );
        assert_eq!(
            plan_resize(800, 600, None, Some(150)),
            ResizePlan::Scale(200, 150)
        );
    }

    #[test]
    fn test_plan_never_enlarges() {
        assert_eq!(plan_resize(100, 50, Some(400), None), ResizePlan::Keep);
        assert_eq!(plan_resize(100, 50, None, Some(51)), ResizePlan::Keep);
        assert_eq!(plan_resize(100, 50, Some(200), Some(200)), ResizePlan::Keep);
        assert_eq!(
            plan_resize(100, 50, Some(80), Some(200)),
            ResizePlan::Fill(80, 50)
        );
    }

    #[test]
    fn test_plan_both_axes_covers() {
        assert_eq!(
            plan_resize(800, 600, Some(300), Some(300)),
            ResizePlan::Fill(300, 300)
        );
    }

    #[tokio::test]
    async fn test_no_enlargement_on_width_only() {
        let transformer = ImageTransformer::new();
        let opts = TransformOptions::new(ImageFormat::Png, 80).with_width(400);

        let out = transformer.transform(png_fixture(100, 50), &opts).await.unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 100);
        assert_eq!(decoded.height(), 50);
    }

    #[tokio::test]
    async fn test_downscale_to_webp() {
        let transformer = ImageTransformer::new();
        let opts = TransformOptions::new(ImageFormat::Webp, 80).with_width(32);

        let out = transformer.transform(png_fixture(64, 48), &opts).await.unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), Codec::WebP);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[tokio::test]
    async fn test_cover_crop_to_jpeg() {
        let transformer = ImageTransformer::new();
        let opts = TransformOptions::new(ImageFormat::Jpeg, 70)
            .with_width(20)
            .with_height(20);

        let out = transformer.transform(png_fixture(64, 32), &opts).await.unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), Codec::Jpeg);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 20));
    }

    #[tokio::test]
    async fn test_garbage_bytes_fail_transformation() {
        let transformer = ImageTransformer::new();
        let opts = TransformOptions::new(ImageFormat::Webp, 80);

        let result = transformer.transform(b"not an image".to_vec(), &opts).await;
        assert!(matches!(
            result,
            Err(ImageCacheError::TransformationFailed(_))
        ));
    }
}
