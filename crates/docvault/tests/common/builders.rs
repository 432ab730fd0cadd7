//! Builders for test uploads and configurations.
//!
//! Fixtures are generated in memory so the tests carry no binary files.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;

use docvault::config::{Config, PdfCompressor};
use docvault::intake::UploadedFile;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// A gradient with some noise so the encoder cannot squeeze it to nothing.
fn pattern(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let noise = ((x * 7919 + y * 104_729) % 97) as u8;
        Rgb([
            (x % 256) as u8 ^ noise,
            (y % 256) as u8,
            ((x + y) % 256) as u8 ^ noise.rotate_left(3),
        ])
    })
}

/// A baseline JPEG of the given size.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 85)
        .encode_image(&pattern(width, height))
        .expect("Failed to encode JPEG fixture");
    out
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    pattern(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .expect("Failed to encode PNG fixture");
    out.into_inner()
}

/// The noise pattern in any encodable format, with an alpha channel so GIF
/// and WebP accept it.
pub fn image_bytes(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(pattern(width, height))
        .to_rgba8()
        .write_to(&mut out, format)
        .expect("Failed to encode image fixture");
    out.into_inner()
}

/// A two-tone SVG drawing with an XML declaration.
pub fn svg_bytes(width: u32, height: u32) -> Vec<u8> {
    format!(
        r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">
  <rect width="{w}" height="{h}" fill="#fafafa"/>
  <circle cx="{cx}" cy="{cy}" r="{r}" fill="#e53935"/>
</svg>
"##,
        w = width,
        h = height,
        cx = width / 2,
        cy = height / 2,
        r = width.min(height) / 3,
    )
    .into_bytes()
}

/// A DOCX containing one paragraph per entry.
pub fn docx_bytes(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("[Content_Types].xml", options)
        .expect("Failed to start zip entry");
    writer
        .write_all(br#"<?xml version="1.0"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#)
        .expect("Failed to write zip entry");
    writer
        .start_file("word/document.xml", options)
        .expect("Failed to start zip entry");
    writer
        .write_all(document.as_bytes())
        .expect("Failed to write zip entry");
    writer
        .finish()
        .expect("Failed to finish DOCX fixture")
        .into_inner()
}

pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

pub fn jpeg_upload(name: &str) -> UploadedFile {
    UploadedFile::new(name, Some("image/jpeg"), jpeg_bytes(160, 120))
}

pub fn docx_upload(name: &str, paragraphs: &[&str]) -> UploadedFile {
    UploadedFile::new(name, Some(DOCX_MIME), docx_bytes(paragraphs))
}

/// Builder for a `Config` suited to fast, hermetic tests.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(storage_root: &Path) -> Self {
        let mut config = Config::new(storage_root);
        config.queue.backoff_delay_ms = 0;
        config.queue.poll_interval_ms = 20;
        config.pdf.compressor = PdfCompressor::Builtin;
        Self { config }
    }

    pub fn database_path(mut self, path: &Path) -> Self {
        self.config.database_path = Some(path.to_path_buf());
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.config.queue.attempts = attempts;
        self
    }

    pub fn lock_duration_secs(mut self, secs: u64) -> Self {
        self.config.queue.lock_duration_secs = secs;
        self
    }

    pub fn max_items_per_layer(mut self, max: usize) -> Self {
        self.config.shard.max_items_per_layer = max;
        self
    }

    pub fn image_max_mb(mut self, mb: f64) -> Self {
        self.config.limits.image_max_mb = mb;
        self
    }

    pub fn reject_on_mismatch(mut self, reject: bool) -> Self {
        self.config.intake.reject_on_mismatch = reject;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
