use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::detect::FileCategory;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Root of the shard tree; temp uploads live in `<storage_root>/temp`.
    pub storage_root: PathBuf,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub shard: ShardConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub pdf: PdfConfig,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// A configuration with every section at its default, rooted at `storage_root`.
    pub fn new<P: Into<PathBuf>>(storage_root: P) -> Self {
        Self {
            version: "1.0".to_string(),
            storage_root: storage_root.into(),
            database_path: None,
            public_base_url: default_public_base_url(),
            intake: IntakeConfig::default(),
            limits: LimitsConfig::default(),
            shard: ShardConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            image: ImageConfig::default(),
            audio: AudioConfig::default(),
            pdf: PdfConfig::default(),
            document: DocumentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.storage_root.join("temp")
    }

    /// The configured database path, falling back to `~/.docvault/data/docvault.db`
    /// and finally to a file inside the storage root.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
            .unwrap_or_else(|| self.storage_root.join("docvault.db"))
    }
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_allowed_categories")]
    pub allowed_categories: Vec<FileCategory>,
    #[serde(default = "default_true")]
    pub reject_on_mismatch: bool,
    #[serde(default = "default_true")]
    pub log_suspicious: bool,
}

fn default_allowed_categories() -> Vec<FileCategory> {
    FileCategory::ALL.to_vec()
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            allowed_categories: default_allowed_categories(),
            reject_on_mismatch: true,
            log_suspicious: true,
        }
    }
}

/// Per-category upload ceilings in megabytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_image_max_mb")]
    pub image_max_mb: f64,
    #[serde(default = "default_media_max_mb")]
    pub audio_max_mb: f64,
    #[serde(default = "default_media_max_mb")]
    pub pdf_max_mb: f64,
    #[serde(default = "default_document_max_mb")]
    pub document_max_mb: f64,
}

fn default_image_max_mb() -> f64 {
    10.0
}

fn default_media_max_mb() -> f64 {
    50.0
}

fn default_document_max_mb() -> f64 {
    25.0
}

impl LimitsConfig {
    pub fn max_mb(&self, category: FileCategory) -> f64 {
        match category {
            FileCategory::Image => self.image_max_mb,
            FileCategory::Audio => self.audio_max_mb,
            FileCategory::Pdf => self.pdf_max_mb,
            FileCategory::Document => self.document_max_mb,
        }
    }

    pub fn max_bytes(&self, category: FileCategory) -> u64 {
        (self.max_mb(category) * 1024.0 * 1024.0) as u64
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            image_max_mb: default_image_max_mb(),
            audio_max_mb: default_media_max_mb(),
            pdf_max_mb: default_media_max_mb(),
            document_max_mb: default_document_max_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Soft ceiling on direct entries per shard directory.
    #[serde(default = "default_max_items_per_layer")]
    pub max_items_per_layer: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_max_items_per_layer() -> usize {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_items_per_layer: default_max_items_per_layer(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    #[serde(default = "default_remove_on_complete")]
    pub remove_on_complete: usize,
    #[serde(default = "default_remove_on_fail")]
    pub remove_on_fail: usize,
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    #[serde(default = "default_stalled_interval_secs")]
    pub stalled_interval_secs: u64,
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_delay_ms() -> u64 {
    2000
}

fn default_remove_on_complete() -> usize {
    10
}

fn default_remove_on_fail() -> usize {
    5
}

fn default_lock_duration_secs() -> u64 {
    60 * 60
}

fn default_stalled_interval_secs() -> u64 {
    60
}

fn default_max_stalled_count() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_delay_ms: default_backoff_delay_ms(),
            remove_on_complete: default_remove_on_complete(),
            remove_on_fail: default_remove_on_fail(),
            lock_duration_secs: default_lock_duration_secs(),
            stalled_interval_secs: default_stalled_interval_secs(),
            max_stalled_count: default_max_stalled_count(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Worker threads per category pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_concurrency")]
    pub image: usize,
    #[serde(default = "default_concurrency")]
    pub audio: usize,
    #[serde(default = "default_concurrency")]
    pub pdf: usize,
    #[serde(default = "default_concurrency")]
    pub document: usize,
}

fn default_concurrency() -> usize {
    1
}

impl WorkersConfig {
    pub fn concurrency(&self, category: FileCategory) -> usize {
        match category {
            FileCategory::Image => self.image,
            FileCategory::Audio => self.audio,
            FileCategory::Pdf => self.pdf,
            FileCategory::Document => self.document,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            image: 1,
            audio: 1,
            pdf: 1,
            document: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_width")]
    pub width: u32,
    #[serde(default = "default_image_height")]
    pub height: u32,
    #[serde(default = "default_image_quality")]
    pub quality: u8,
    #[serde(default = "default_image_thumb_size")]
    pub thumb_size: u32,
    #[serde(default = "default_thumb_quality")]
    pub thumb_quality: u8,
}

fn default_image_width() -> u32 {
    800
}

fn default_image_height() -> u32 {
    600
}

fn default_image_quality() -> u8 {
    80
}

fn default_image_thumb_size() -> u32 {
    150
}

fn default_thumb_quality() -> u8 {
    60
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: default_image_width(),
            height: default_image_height(),
            quality: default_image_quality(),
            thumb_size: default_image_thumb_size(),
            thumb_quality: default_thumb_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_waveform_width")]
    pub waveform_width: u32,
    #[serde(default = "default_waveform_height")]
    pub waveform_height: u32,
    #[serde(default = "default_waveform_color")]
    pub waveform_color: String,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_bitrate_kbps() -> u32 {
    128
}

fn default_waveform_width() -> u32 {
    400
}

fn default_waveform_height() -> u32 {
    100
}

fn default_waveform_color() -> String {
    "0x3498db".to_string()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            bitrate_kbps: default_bitrate_kbps(),
            waveform_width: default_waveform_width(),
            waveform_height: default_waveform_height(),
            waveform_color: default_waveform_color(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PdfCompressor {
    /// `gs -sDEVICE=pdfwrite`.
    #[default]
    Ghostscript,
    /// In-process stream compression with lopdf.
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfConfig {
    #[serde(default)]
    pub compressor: PdfCompressor,
    #[serde(default = "default_ghostscript_path")]
    pub ghostscript_path: String,
    #[serde(default = "default_pdftoppm_path")]
    pub pdftoppm_path: String,
    /// Ghostscript `-dPDFSETTINGS` preset without the leading slash.
    #[serde(default = "default_pdf_preset")]
    pub preset: String,
    #[serde(default = "default_pdf_thumb_size")]
    pub thumb_size: u32,
    #[serde(default = "default_thumb_quality")]
    pub thumb_quality: u8,
}

fn default_ghostscript_path() -> String {
    "gs".to_string()
}

fn default_pdftoppm_path() -> String {
    "pdftoppm".to_string()
}

fn default_pdf_preset() -> String {
    "printer".to_string()
}

fn default_pdf_thumb_size() -> u32 {
    300
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            compressor: PdfCompressor::default(),
            ghostscript_path: default_ghostscript_path(),
            pdftoppm_path: default_pdftoppm_path(),
            preset: default_pdf_preset(),
            thumb_size: default_pdf_thumb_size(),
            thumb_quality: default_thumb_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Characters of extracted text kept in the description file.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

fn default_compression_level() -> u32 {
    9
}

fn default_excerpt_chars() -> usize {
    200
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
