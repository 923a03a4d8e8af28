//! Preview transcoding using exiftool and the `image` crate
//!
//! RAW files are decoded by extracting the embedded JPEG with exiftool's
//! JpgFromRaw tag (PreviewImage as a fallback), the same way grid thumbnails
//! are produced. Everything else is decoded directly by the `image` crate.

use crate::SourceFormat;
use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use rayon::prelude::*;
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

/// A decoded source image together with the orientation it was stored in
pub struct SourceImage {
    pub image: DynamicImage,
    pub orientation: Orientation,
}

/// Decode, orient, resize and encode images
pub trait Transcoder: Send + Sync {
    fn decode(&self, data: &[u8], format: SourceFormat) -> Result<SourceImage>;

    fn auto_orient(&self, source: SourceImage) -> DynamicImage {
        let SourceImage {
            mut image,
            orientation,
        } = source;
        image.apply_orientation(orientation);
        image
    }

    /// Fit within `max_long_edge`, preserving aspect ratio. Never upscales.
    fn resize(&self, image: &DynamicImage, max_long_edge: u32) -> DynamicImage;

    fn encode(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>>;
}

/// Render every size from one decoded image in parallel
pub fn render_tiers<T: Transcoder + ?Sized>(
    transcoder: &T,
    image: &DynamicImage,
    sizes: &[u32],
    quality: u8,
) -> Vec<(u32, Result<Vec<u8>>)> {
    sizes
        .par_iter()
        .map(|&size| {
            let resized = transcoder.resize(image, size);
            (size, transcoder.encode(&resized, quality))
        })
        .collect()
}

/// Default transcoder backed by the `image` crate
#[derive(Debug, Clone)]
pub struct ImageTranscoder {
    exiftool: String,
}

impl Default for ImageTranscoder {
    fn default() -> Self {
        Self {
            exiftool: "exiftool".to_string(),
        }
    }
}

impl ImageTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific exiftool binary instead of the one on PATH
    pub fn with_exiftool(path: impl Into<String>) -> Self {
        Self {
            exiftool: path.into(),
        }
    }

    fn decode_bytes(data: &[u8]) -> Result<SourceImage> {
        let mut decoder = ImageReader::new(Cursor::new(data))
            .with_guessed_format()?
            .into_decoder()
            .context("Unsupported image format")?;
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let image = DynamicImage::from_decoder(decoder).context("Failed to decode image")?;
        Ok(SourceImage { image, orientation })
    }

    fn decode_raw(&self, data: &[u8]) -> Result<SourceImage> {
        let mut jpeg = self.run_exiftool(data, &["-b", "-JpgFromRaw"])?;
        if jpeg.is_empty() {
            jpeg = self.run_exiftool(data, &["-b", "-PreviewImage"])?;
        }
        if jpeg.is_empty() {
            bail!("No embedded JPEG found in RAW data");
        }

        let mut source = Self::decode_bytes(&jpeg)?;
        // Embedded previews rarely carry orientation; the RAW container does
        if let Some(orientation) = self.raw_orientation(data) {
            source.orientation = orientation;
        }
        Ok(source)
    }

    fn raw_orientation(&self, data: &[u8]) -> Option<Orientation> {
        let output = self.run_exiftool(data, &["-s3", "-n", "-Orientation"]).ok()?;
        let value: u8 = String::from_utf8_lossy(&output).trim().parse().ok()?;
        Orientation::from_exif(value)
    }

    /// Run exiftool over stdin and return its stdout
    fn run_exiftool(&self, data: &[u8], args: &[&str]) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.exiftool)
            .args(args)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.exiftool))?;

        let mut stdin = child.stdin.take().context("exiftool stdin unavailable")?;
        let output = std::thread::scope(|scope| {
            // Feed stdin from a second thread so a full stdout pipe cannot deadlock us
            let writer = scope.spawn(move || stdin.write_all(data));
            let output = child.wait_with_output();
            let _ = writer.join();
            output
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("exiftool failed: {}", stderr.trim());
        }
        Ok(output.stdout)
    }
}

impl Transcoder for ImageTranscoder {
    fn decode(&self, data: &[u8], format: SourceFormat) -> Result<SourceImage> {
        match format {
            SourceFormat::Raw => self.decode_raw(data),
            SourceFormat::Lossless | SourceFormat::Standard => Self::decode_bytes(data),
        }
    }

    fn resize(&self, image: &DynamicImage, max_long_edge: u32) -> DynamicImage {
        let (width, height) = image.dimensions();
        let long_edge = width.max(height);

        if max_long_edge == 0 || long_edge <= max_long_edge {
            return image.clone();
        }

        let ratio = max_long_edge as f64 / long_edge as f64;
        let new_width = ((width as f64 * ratio).round() as u32).max(1);
        let new_height = ((height as f64 * ratio).round() as u32).max(1);

        image.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3)
    }

    fn encode(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        // JPEG has no alpha channel
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
            .context("Failed to encode JPEG")?;
        Ok(buffer)
    }
}
