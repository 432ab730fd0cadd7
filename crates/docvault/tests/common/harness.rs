//! Test harness for isolated test execution.
//!
//! The `TestHarness` owns a temp directory holding the storage root and a
//! file-backed database, plus a `VaultService` built on them. Jobs can be
//! run synchronously with `run_next`/`run_pending`, or by real worker pools
//! through the service.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use docvault::broadcast::JobProgressBroadcaster;
use docvault::config::Config;
use docvault::db::document_repo::DocumentRow;
use docvault::detect::FileCategory;
use docvault::intake::{IntakePolicy, UploadedFile};
use docvault::processor::{MediaProcessor, ProcessorRegistry};
use docvault::queue::{JobState, QueueJob};
use docvault::service::{UploadItem, UploadResponse, VaultService};
use docvault::worker::{JobResult, JobRunner};

use super::builders::ConfigBuilder;

pub struct TestHarness {
    temp_dir: TempDir,
    pub storage_root: PathBuf,
    pub database_path: PathBuf,
    pub service: VaultService,
}

impl TestHarness {
    /// A harness with the default test configuration.
    pub fn new() -> Self {
        Self::with_config(|builder| builder)
    }

    /// A harness whose configuration is adjusted by `customize`.
    pub fn with_config(customize: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage_root = temp_dir.path().join("uploads");
        let database_path = temp_dir.path().join("data").join("docvault.db");

        let config = customize(ConfigBuilder::new(&storage_root).database_path(&database_path)).build();
        let service = VaultService::open(config).expect("Failed to open service");

        Self {
            temp_dir,
            storage_root,
            database_path,
            service,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config(&self) -> &Config {
        self.service.config()
    }

    /// Uploads under the strict policy and expects acceptance.
    pub fn upload(&self, files: Vec<UploadedFile>) -> UploadResponse {
        self.service
            .upload(files, &IntakePolicy::strict())
            .expect("Upload was rejected")
    }

    pub fn upload_one(&self, file: UploadedFile) -> UploadItem {
        self.upload(vec![file]).items.remove(0)
    }

    /// The public id embedded in an upload item's link.
    pub fn public_id(item: &UploadItem) -> String {
        item.link
            .as_deref()
            .and_then(|link| link.rsplit('/').next())
            .expect("Upload item has no link")
            .to_string()
    }

    pub fn document(&self, item: &UploadItem) -> DocumentRow {
        self.service
            .get_document(&Self::public_id(item))
            .expect("Failed to load document")
            .expect("Document not found")
    }

    pub fn job(&self, item: &UploadItem) -> QueueJob {
        let job_id = item.job_id.as_deref().expect("Upload item has no job id");
        self.service
            .queue()
            .find(job_id)
            .expect("Failed to load job")
            .expect("Job not found")
    }

    fn runner(&self, processor: Arc<dyn MediaProcessor>) -> JobRunner {
        JobRunner::new(
            self.service.database().clone(),
            self.service.queue().clone(),
            processor,
            JobProgressBroadcaster::default(),
        )
    }

    /// Claims and runs a single job of `category`, if one is due.
    pub fn run_next(&self, category: FileCategory, processors: &ProcessorRegistry) -> Option<JobResult> {
        let processor = processors.get(category)?;
        let job = self.service.queue().claim(category).expect("Failed to claim job")?;
        Some(self.runner(processor).run(&job).expect("Job run failed"))
    }

    /// Runs jobs of every registered category until no job is due.
    pub fn run_pending(&self, processors: &ProcessorRegistry) -> Vec<JobResult> {
        let mut results = Vec::new();
        loop {
            let before = results.len();
            for category in processors.categories() {
                while let Some(result) = self.run_next(category, processors) {
                    results.push(result);
                }
            }
            if results.len() == before {
                return results;
            }
        }
    }

    /// Polls until the job reaches a final state or `timeout` passes.
    pub fn wait_for_job(&self, job_id: &str, timeout: Duration) -> QueueJob {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self
                .service
                .queue()
                .find(job_id)
                .expect("Failed to load job")
                .expect("Job not found");
            if matches!(job.state, JobState::Completed | JobState::Failed) {
                return job;
            }
            assert!(Instant::now() < deadline, "Job {} did not finish in time", job_id);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Number of regular files left in the temp upload area.
    pub fn temp_file_count(&self) -> usize {
        std::fs::read_dir(self.config().temp_dir())
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}
