//! Pixel-level operations, isolated behind a trait so the cache core never
//! depends on a particular codec library directly.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::error::AppError;

#[derive(Clone)]
pub struct DecodedImage(pub DynamicImage);

impl DecodedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }
}

pub trait ImageBackend: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, AppError>;
    fn encode(&self, image: &DecodedImage, format: &str) -> Result<Vec<u8>, AppError>;

    /// Exact-size resize, used by the `size(w,h)` op.
    fn resize(&self, image: &DecodedImage, w: u32, h: u32) -> DecodedImage;

    /// Pixel-rectangle crop starting at `(x, y)`.
    fn crop(&self, image: &DecodedImage, w: u32, h: u32, x: u32, y: u32) -> DecodedImage;

    /// Aspect-preserving fit within a box, used by `thumbnail(w,h,...)`.
    fn fit(&self, image: &DecodedImage, w: u32, h: u32) -> DecodedImage;

    /// `None` means the back end has no seam-carving support; callers fall
    /// back to [`ImageBackend::fit`].
    fn liquid_rescale(&self, image: &DecodedImage, w: u32, h: u32) -> Option<DecodedImage>;

    fn equalize(&self, image: &DecodedImage) -> DecodedImage;
    fn unsharp_mask(&self, image: &DecodedImage) -> DecodedImage;

    fn extract_metadata(&self, image: &DecodedImage) -> Vec<(String, String)>;
}

pub struct RealImageBackend;

impl RealImageBackend {
    pub fn new() -> Self {
        RealImageBackend
    }
}

impl Default for RealImageBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn format_for(ext: &str) -> Result<ImageFormat, AppError> {
    ImageFormat::from_extension(ext)
        .ok_or_else(|| AppError::DecoderError(format!("unsupported format: {ext}")))
}

impl ImageBackend for RealImageBackend {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, AppError> {
        image::load_from_memory(bytes)
            .map(DecodedImage)
            .map_err(|e| AppError::DecoderError(e.to_string()))
    }

    fn encode(&self, image: &DecodedImage, format: &str) -> Result<Vec<u8>, AppError> {
        let fmt = format_for(format)?;
        let mut out = Cursor::new(Vec::new());
        image
            .0
            .write_to(&mut out, fmt)
            .map_err(|e| AppError::DecoderError(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn resize(&self, image: &DecodedImage, w: u32, h: u32) -> DecodedImage {
        DecodedImage(
            image
                .0
                .resize_exact(w, h, image::imageops::FilterType::Lanczos3),
        )
    }

    fn crop(&self, image: &DecodedImage, w: u32, h: u32, x: u32, y: u32) -> DecodedImage {
        DecodedImage(image.0.crop_imm(x, y, w, h))
    }

    fn fit(&self, image: &DecodedImage, w: u32, h: u32) -> DecodedImage {
        DecodedImage(image.0.resize(w, h, image::imageops::FilterType::Lanczos3))
    }

    fn liquid_rescale(&self, _image: &DecodedImage, _w: u32, _h: u32) -> Option<DecodedImage> {
        None
    }

    fn equalize(&self, image: &DecodedImage) -> DecodedImage {
        let mut buf = image.0.to_rgba8();
        for channel in 0..3 {
            let mut histogram = [0u32; 256];
            for px in buf.pixels() {
                histogram[px.0[channel] as usize] += 1;
            }
            let total: u32 = histogram.iter().sum();
            if total == 0 {
                continue;
            }
            let mut cdf = [0u32; 256];
            let mut running = 0u32;
            for (i, count) in histogram.iter().enumerate() {
                running += count;
                cdf[i] = running;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0).copied().unwrap_or(0);
            let denom = (total - cdf_min).max(1) as f32;
            let lut: Vec<u8> = cdf
                .iter()
                .map(|&v| (((v.saturating_sub(cdf_min)) as f32 / denom) * 255.0).round() as u8)
                .collect();
            for px in buf.pixels_mut() {
                px.0[channel] = lut[px.0[channel] as usize];
            }
        }
        DecodedImage(DynamicImage::ImageRgba8(buf))
    }

    fn unsharp_mask(&self, image: &DecodedImage) -> DecodedImage {
        DecodedImage(image.0.unsharpen(1.0, 2))
    }

    fn extract_metadata(&self, image: &DecodedImage) -> Vec<(String, String)> {
        let (w, h) = image.dimensions();
        vec![
            ("width".to_string(), w.to_string()),
            ("height".to_string(), h.to_string()),
            ("color_type".to_string(), format!("{:?}", image.0.color())),
        ]
    }
}
