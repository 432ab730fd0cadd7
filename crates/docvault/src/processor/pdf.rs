use std::path::{Path, PathBuf};

use crate::config::{PdfCompressor, PdfConfig};
use crate::detect::FileCategory;
use crate::error::ProcessError;
use crate::processor::command::run_tool;
use crate::processor::image::write_jpeg;
use crate::processor::{read_error, write_error, MediaProcessor, WorkItem};
use crate::storage::filesystem::remove_artifact;

/// Compresses PDFs with Ghostscript (or lopdf) and renders page one as the
/// thumbnail through pdftoppm.
pub struct PdfProcessor {
    config: PdfConfig,
}

impl PdfProcessor {
    pub fn new(config: PdfConfig) -> Self {
        Self { config }
    }

    fn ghostscript_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-sDEVICE=pdfwrite".to_string(),
            "-dCompatibilityLevel=1.4".to_string(),
            format!("-dPDFSETTINGS=/{}", self.config.preset),
            "-dNOPAUSE".to_string(),
            "-dQUIET".to_string(),
            "-dBATCH".to_string(),
            format!("-sOutputFile={}", output.display()),
            input.display().to_string(),
        ]
    }

    fn render_args(&self, input: &Path, prefix: &Path) -> Vec<String> {
        vec![
            "-jpeg".to_string(),
            "-f".to_string(),
            "1".to_string(),
            "-l".to_string(),
            "1".to_string(),
            "-singlefile".to_string(),
            "-scale-to".to_string(),
            (self.config.thumb_size * 2).to_string(),
            input.display().to_string(),
            prefix.display().to_string(),
        ]
    }
}

impl MediaProcessor for PdfProcessor {
    fn category(&self) -> FileCategory {
        FileCategory::Pdf
    }

    fn transform(&self, item: &WorkItem<'_>) -> Result<(), ProcessError> {
        let _span = tracing::info_span!(
            "processor.pdf",
            compressor = ?self.config.compressor
        )
        .entered();

        match self.config.compressor {
            PdfCompressor::Ghostscript => {
                run_tool(
                    &self.config.ghostscript_path,
                    self.ghostscript_args(item.input, item.output),
                )?;
            }
            PdfCompressor::Builtin => compress_builtin(item.input, item.output)?,
        }

        keep_smaller(item.input, item.output)
    }

    fn thumbnail(&self, item: &WorkItem<'_>) -> Result<PathBuf, ProcessError> {
        let _span = tracing::info_span!("processor.pdf.thumbnail").entered();

        let prefix = std::env::temp_dir().join(format!("docvault_page_{}", uuid::Uuid::new_v4()));
        let rendered = prefix.with_extension("jpg");

        let result = run_tool(&self.config.pdftoppm_path, self.render_args(item.output, &prefix))
            .and_then(|_| {
                let page = ::image::open(&rendered)
                    .map_err(|e| ProcessError::ImageDecode(e.to_string()))?;
                let size = self.config.thumb_size;
                let path = item.thumbnail_path(".jpg");
                write_jpeg(&page.thumbnail(size, size), &path, self.config.thumb_quality)?;
                Ok(path)
            });

        remove_artifact(&rendered);
        result
    }
}

/// Recompresses every stream with lopdf.
fn compress_builtin(input: &Path, output: &Path) -> Result<(), ProcessError> {
    let bytes = std::fs::read(input).map_err(|e| read_error(input, e))?;
    let mut doc = lopdf::Document::load_mem(&bytes)
        .map_err(|e| ProcessError::PdfProcessing(format!("Failed to load PDF: {}", e)))?;
    doc.compress();

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| ProcessError::PdfProcessing(format!("Failed to save PDF: {}", e)))?;
    std::fs::write(output, buffer).map_err(|e| write_error(output, e))
}

/// If compression made the file bigger, the original replaces it.
fn keep_smaller(input: &Path, output: &Path) -> Result<(), ProcessError> {
    let before = std::fs::metadata(input)
        .map_err(|e| read_error(input, e))?
        .len();
    let after = std::fs::metadata(output)
        .map_err(|e| read_error(output, e))?
        .len();

    if after > before {
        tracing::debug!(before, after, "Compressed PDF is larger, keeping the original");
        std::fs::copy(input, output).map_err(|e| write_error(output, e))?;
    }
    Ok(())
}
