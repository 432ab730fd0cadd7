use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("No config path available: set DOCVAULT_CONFIG or provide a home directory")]
    NoConfigPath,
}

/// Errors raised while accepting an upload, before anything is enqueued.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("No files were provided")]
    NoFiles,

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unknown document status '{0}'")]
    UnknownStatus(String),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Invalid page request: {0}")]
    InvalidPage(String),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read input '{path}': {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output '{path}': {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Input '{path}' is {size} bytes, above the {limit} byte limit")]
    InputTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Failed to decode image: {0}")]
    ImageDecode(String),

    #[error("Failed to encode image: {0}")]
    ImageEncode(String),

    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to process PDF: {0}")]
    PdfProcessing(String),

    #[error("Failed to process document: {0}")]
    DocumentProcessing(String),
}

impl ProcessError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Oversized or undecodable inputs fail the same way every time, so the
    /// queue skips the remaining attempts for them.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProcessError::UnsupportedFormat(_)
                | ProcessError::InputTooLarge { .. }
                | ProcessError::ImageDecode(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read metadata for '{path}': {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to generate random bytes: {0}")]
    Random(String),

    #[error("Could not find a free directory name under '{0}'")]
    HashExhausted(PathBuf),

    #[error("Shard tree kept changing underneath the allocator after {0} attempts")]
    Contended(u32),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Invalid job payload for '{id}': {reason}")]
    InvalidPayload { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("No processor registered for category '{0}'")]
    MissingProcessor(String),

    #[error("Job failed: {0}")]
    JobFailed(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
