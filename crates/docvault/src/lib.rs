pub mod broadcast;
pub mod config;
pub mod db;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod processor;
pub mod queue;
pub mod sanitize;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, Config};
pub use detect::{detect, DetectionResult, FileCategory};
pub use error::{
    ConfigError, IntakeError, ProcessError, QueueError, Result, StorageError, VaultError,
    WorkerError,
};
pub use intake::{IntakePolicy, UploadedFile};
pub use processor::{MediaProcessor, ProcessorRegistry};
pub use service::{Resolution, UploadError, VaultService, WorkerSet};
