pub mod audio;
pub mod command;
pub mod document;
pub mod image;
pub mod pdf;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::detect::FileCategory;
use crate::error::ProcessError;

/// Files involved in processing one upload.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem<'a> {
    /// Temp copy of the upload; never modified.
    pub input: &'a Path,
    /// Where the converted artifact goes.
    pub output: &'a Path,
    pub thumb_dir: &'a Path,
    pub display_name: &'a str,
}

impl WorkItem<'_> {
    /// `<thumb_dir>/<artifact stem><suffix>`.
    pub fn thumbnail_path(&self, suffix: &str) -> PathBuf {
        let name = self
            .output
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let name = name.strip_suffix(".gz").unwrap_or(name);
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        self.thumb_dir.join(format!("{}{}", stem, suffix))
    }
}

/// Converts one category of upload into its stored artifact and thumbnail.
pub trait MediaProcessor: Send + Sync {
    fn category(&self) -> FileCategory;

    /// Writes the converted artifact to `item.output`. The parent directory
    /// exists.
    fn transform(&self, item: &WorkItem<'_>) -> Result<(), ProcessError>;

    /// Writes the thumbnail (or textual stand-in) for the finished artifact
    /// into `item.thumb_dir` and returns its path.
    fn thumbnail(&self, item: &WorkItem<'_>) -> Result<PathBuf, ProcessError>;
}

/// One processor per category.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<FileCategory, Arc<dyn MediaProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four stock processors, configured from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with(image::ImageProcessor::new(
                config.image.clone(),
                config.limits.max_bytes(FileCategory::Image),
            ))
            .with(audio::AudioProcessor::new(config.audio.clone()))
            .with(pdf::PdfProcessor::new(config.pdf.clone()))
            .with(document::DocumentProcessor::new(config.document.clone()))
    }

    /// Registers `processor`, replacing any previous one for its category.
    pub fn with<P: MediaProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors
            .insert(processor.category(), Arc::new(processor));
        self
    }

    pub fn get(&self, category: FileCategory) -> Option<Arc<dyn MediaProcessor>> {
        self.processors.get(&category).cloned()
    }

    pub fn categories(&self) -> Vec<FileCategory> {
        FileCategory::ALL
            .into_iter()
            .filter(|c| self.processors.contains_key(c))
            .collect()
    }
}

pub(crate) fn read_error(path: &Path, source: std::io::Error) -> ProcessError {
    ProcessError::ReadInput {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn write_error(path: &Path, source: std::io::Error) -> ProcessError {
    ProcessError::WriteOutput {
        path: path.to_path_buf(),
        source,
    }
}
