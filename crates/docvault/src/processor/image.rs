use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, RgbaImage};
use resvg::{tiny_skia, usvg};

use crate::config::ImageConfig;
use crate::detect::FileCategory;
use crate::error::ProcessError;
use crate::processor::{read_error, write_error, MediaProcessor, WorkItem};

/// Re-encodes images as size-bounded JPEGs with a square cropped thumbnail.
/// SVG input is rasterized onto white within the same bounds.
pub struct ImageProcessor {
    config: ImageConfig,
    max_input_bytes: u64,
}

impl ImageProcessor {
    pub fn new(config: ImageConfig, max_input_bytes: u64) -> Self {
        Self {
            config,
            max_input_bytes,
        }
    }
}

impl MediaProcessor for ImageProcessor {
    fn category(&self) -> FileCategory {
        FileCategory::Image
    }

    fn transform(&self, item: &WorkItem<'_>) -> Result<(), ProcessError> {
        let _span = tracing::info_span!("processor.image").entered();

        let size = std::fs::metadata(item.input)
            .map_err(|e| read_error(item.input, e))?
            .len();
        if size > self.max_input_bytes {
            return Err(ProcessError::InputTooLarge {
                path: item.input.to_path_buf(),
                size,
                limit: self.max_input_bytes,
            });
        }

        let data = std::fs::read(item.input).map_err(|e| read_error(item.input, e))?;
        let img = if is_svg(&data) {
            rasterize_svg(&data, self.config.width, self.config.height)?
        } else {
            decode_raster(item.input, data)?
        };
        let (width, height) = img.dimensions();
        let bounded = if width > self.config.width || height > self.config.height {
            img.resize(self.config.width, self.config.height, FilterType::Lanczos3)
        } else {
            img
        };

        write_jpeg(&bounded, item.output, self.config.quality)?;
        tracing::debug!(
            from = %format!("{}x{}", width, height),
            to = %format!("{}x{}", bounded.width(), bounded.height()),
            "Image re-encoded"
        );
        Ok(())
    }

    fn thumbnail(&self, item: &WorkItem<'_>) -> Result<PathBuf, ProcessError> {
        let _span = tracing::info_span!("processor.image.thumbnail").entered();

        let size = self.config.thumb_size;
        let data = std::fs::read(item.output).map_err(|e| read_error(item.output, e))?;
        let thumb = decode_raster(item.output, data)?.resize_to_fill(size, size, FilterType::Triangle);
        let path = item.thumbnail_path(".jpg");
        write_jpeg(&thumb, &path, self.config.thumb_quality)?;
        Ok(path)
    }
}

fn decode_raster(path: &Path, data: Vec<u8>) -> Result<DynamicImage, ProcessError> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| read_error(path, e))?
        .decode()
        .map_err(|e| ProcessError::ImageDecode(e.to_string()))
}

/// Same prefixes the intake detector files under `image/svg+xml`.
fn is_svg(data: &[u8]) -> bool {
    data.starts_with(b"<svg") || data.starts_with(b"<?xml")
}

/// Renders an SVG no larger than `max_width` x `max_height`. Small drawings
/// keep their intrinsic size.
fn rasterize_svg(data: &[u8], max_width: u32, max_height: u32) -> Result<DynamicImage, ProcessError> {
    let tree = usvg::Tree::from_data(data, &usvg::Options::default())
        .map_err(|e| ProcessError::ImageDecode(format!("SVG: {}", e)))?;

    let size = tree.size();
    let scale = (max_width as f32 / size.width())
        .min(max_height as f32 / size.height())
        .min(1.0);
    let width = (size.width() * scale).round().max(1.0) as u32;
    let height = (size.height() * scale).round().max(1.0) as u32;

    let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
        ProcessError::ImageDecode(format!("SVG: cannot allocate {}x{} canvas", width, height))
    })?;
    // Opaque background, so the premultiplied pixels equal straight RGBA.
    pixmap.fill(tiny_skia::Color::WHITE);
    resvg::render(
        &tree,
        tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );

    RgbaImage::from_raw(width, height, pixmap.take())
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| ProcessError::ImageDecode("SVG: canvas size mismatch".to_string()))
}

/// Encodes `img` as a baseline JPEG. Alpha is dropped.
pub(crate) fn write_jpeg(img: &DynamicImage, path: &Path, quality: u8) -> Result<(), ProcessError> {
    let file = File::create(path).map_err(|e| write_error(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
    encoder
        .encode_image(&img.to_rgb8())
        .map_err(|e| ProcessError::ImageEncode(e.to_string()))?;
    drop(encoder);

    let file = writer
        .into_inner()
        .map_err(|e| write_error(path, e.into_error()))?;
    file.sync_all().map_err(|e| write_error(path, e))
}
