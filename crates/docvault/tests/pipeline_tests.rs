//! Queue pipeline tests: dispatch, redelivery, retries and terminal failure.

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{docx_upload, TestHarness};
use docvault::db::document_repo::DocumentStatus;
use docvault::detect::FileCategory;
use docvault::error::{IntakeError, ProcessError, VaultError};
use docvault::processor::document::DocumentProcessor;
use docvault::processor::{MediaProcessor, ProcessorRegistry, WorkItem};
use docvault::queue::JobState;
use docvault::service::StatusUpdate;
use docvault::worker::watchdog;
use docvault::worker::JobOutcome;

/// Fails the first `failures` transforms, then behaves like the stock
/// document processor.
struct FlakyProcessor {
    inner: DocumentProcessor,
    failures: u32,
    calls: Arc<AtomicU32>,
    retryable: bool,
}

impl FlakyProcessor {
    fn new(harness: &TestHarness, failures: u32, retryable: bool) -> Self {
        Self {
            inner: DocumentProcessor::new(harness.config().document.clone()),
            failures,
            calls: Arc::new(AtomicU32::new(0)),
            retryable,
        }
    }
}

impl MediaProcessor for FlakyProcessor {
    fn category(&self) -> FileCategory {
        FileCategory::Document
    }

    fn transform(&self, item: &WorkItem<'_>) -> Result<(), ProcessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            if self.retryable {
                return Err(ProcessError::ToolFailed {
                    program: "flaky".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("failure {}", call + 1),
                });
            }
            return Err(ProcessError::UnsupportedFormat("flaky".to_string()));
        }
        self.inner.transform(item)
    }

    fn thumbnail(&self, item: &WorkItem<'_>) -> Result<PathBuf, ProcessError> {
        self.inner.thumbnail(item)
    }
}

fn documents(harness: &TestHarness) -> ProcessorRegistry {
    ProcessorRegistry::new().with(DocumentProcessor::new(harness.config().document.clone()))
}

fn count(harness: &TestHarness, category: FileCategory, state: JobState) -> u64 {
    harness
        .service
        .queue()
        .counts(category)
        .unwrap()
        .into_iter()
        .find(|(s, _)| *s == state)
        .map(|(_, n)| n)
        .unwrap_or(0)
}

#[test]
fn test_upload_creates_one_document_and_one_job() {
    let harness = TestHarness::new();
    let item = harness.upload_one(docx_upload("notes.docx", &["one"]));

    let page = harness.service.list_documents(1, 0).unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.total_pages, 1);
    assert_eq!(count(&harness, FileCategory::Document, JobState::Waiting), 1);
    assert_eq!(count(&harness, FileCategory::Image, JobState::Waiting), 0);

    let job = harness.job(&item);
    assert_eq!(job.document_id, harness.document(&item).id);
    assert!(job.payload.input_path.exists());
    assert!(job.payload.input_path.starts_with(harness.config().temp_dir()));
    assert!(job
        .payload
        .destination_path
        .starts_with(&harness.storage_root));
}

#[test]
fn test_stalled_job_is_redelivered_and_completes_once() {
    let harness = TestHarness::with_config(|b| b.lock_duration_secs(0));
    let item = harness.upload_one(docx_upload("crash.docx", &["before the crash"]));

    // A worker claims the job and dies before finishing.
    let claimed = harness
        .service
        .queue()
        .claim(FileCategory::Document)
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, item.job_id.clone().unwrap());
    std::thread::sleep(Duration::from_millis(5));

    let sweep = watchdog::sweep(harness.service.database(), harness.service.queue()).unwrap();
    assert_eq!(sweep.requeued, vec![claimed.id.clone()]);

    let results = harness.run_pending(&documents(&harness));
    assert_eq!(results.len(), 1);
    assert!(results[0].outcome.is_success());

    // Redelivering the finished job again is a no-op.
    let rerun = harness.run_pending(&documents(&harness));
    assert!(rerun.is_empty());

    assert_eq!(harness.service.list_documents(1, 0).unwrap().total_count, 1);
    assert_eq!(harness.document(&item).status, DocumentStatus::Completed);
    assert_eq!(harness.job(&item).state, JobState::Completed);
}

#[test]
fn test_stall_exhaustion_fails_the_document_and_removes_temp_input() {
    let harness = TestHarness::with_config(|b| b.lock_duration_secs(0));
    let item = harness.upload_one(docx_upload("hung.docx", &["never finishes"]));
    assert_eq!(harness.temp_file_count(), 1);

    // Every claimant dies; the watchdog gives up after max_stalled_count.
    let mut failed = Vec::new();
    for _ in 0..10 {
        let Some(claimed) = harness
            .service
            .queue()
            .claim(FileCategory::Document)
            .unwrap()
        else {
            break;
        };
        std::thread::sleep(Duration::from_millis(5));
        let sweep = watchdog::sweep(harness.service.database(), harness.service.queue()).unwrap();
        if !sweep.failed.is_empty() {
            assert_eq!(sweep.failed, vec![claimed.id]);
            failed = sweep.failed;
            break;
        }
    }

    assert_eq!(failed.len(), 1);
    assert_eq!(harness.job(&item).state, JobState::Failed);
    assert_eq!(harness.document(&item).status, DocumentStatus::Failed);
    assert_eq!(harness.temp_file_count(), 0);
    assert!(harness.run_pending(&documents(&harness)).is_empty());
}

#[test]
fn test_retryable_failures_are_retried_until_success() {
    let harness = TestHarness::new();
    let item = harness.upload_one(docx_upload("flaky.docx", &["eventually"]));

    let flaky = FlakyProcessor::new(&harness, 2, true);
    let calls = Arc::clone(&flaky.calls);
    let registry = ProcessorRegistry::new().with(flaky);

    let results = harness.run_pending(&registry);
    let outcomes: Vec<_> = results.iter().map(|r| &r.outcome).collect();
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], JobOutcome::Retrying { attempt: 1, .. }));
    assert!(matches!(outcomes[1], JobOutcome::Retrying { attempt: 2, .. }));
    assert!(matches!(outcomes[2], JobOutcome::Completed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let doc = harness.document(&item);
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.retries_count, 2);
    assert_eq!(harness.job(&item).state, JobState::Completed);
    assert_eq!(harness.temp_file_count(), 0);
}

#[test]
fn test_exhausted_attempts_fail_the_document() {
    let harness = TestHarness::with_config(|b| b.attempts(2));
    let item = harness.upload_one(docx_upload("doomed.docx", &["never"]));
    let input = harness.job(&item).payload.input_path;

    let registry = ProcessorRegistry::new().with(FlakyProcessor::new(&harness, u32::MAX, true));
    let results = harness.run_pending(&registry);

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0].outcome, JobOutcome::Retrying { .. }));
    assert!(matches!(results[1].outcome, JobOutcome::Failed { .. }));

    let doc = harness.document(&item);
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(!doc.is_processed);
    assert!(doc.document_path.is_none());

    let job = harness.job(&item);
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failed_reason.unwrap().contains("failure 2"));
    assert!(!input.exists());
    assert_empty_leaf(&harness, &job.payload.destination_path);
}

#[test]
fn test_terminal_failure_skips_remaining_attempts() {
    let harness = TestHarness::new();
    let item = harness.upload_one(docx_upload("corrupt.docx", &["x"]));

    let registry = ProcessorRegistry::new().with(FlakyProcessor::new(&harness, 1, false));
    let results = harness.run_pending(&registry);

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].outcome, JobOutcome::Failed { .. }));
    assert_eq!(harness.document(&item).status, DocumentStatus::Failed);
    assert_eq!(harness.job(&item).attempts_made, 1);
}

#[test]
fn test_resetting_failed_document_does_not_requeue() {
    let harness = TestHarness::with_config(|b| b.attempts(1));
    let item = harness.upload_one(docx_upload("reset.docx", &["x"]));
    let registry = ProcessorRegistry::new().with(FlakyProcessor::new(&harness, 1, true));
    harness.run_pending(&registry);
    assert_eq!(harness.document(&item).status, DocumentStatus::Failed);

    let updated = harness
        .service
        .update_status(&StatusUpdate {
            document_id: TestHarness::public_id(&item),
            status: "PENDING".to_string(),
            retries_count: Some(0),
        })
        .unwrap();
    assert_eq!(updated.status, DocumentStatus::Pending);
    assert_eq!(updated.retries_count, 0);

    assert_eq!(count(&harness, FileCategory::Document, JobState::Waiting), 0);
    assert!(harness.run_pending(&documents(&harness)).is_empty());
    assert_eq!(harness.document(&item).status, DocumentStatus::Pending);
}

#[test]
fn test_completed_document_cannot_move_back_to_pending() {
    let harness = TestHarness::new();
    let item = harness.upload_one(docx_upload("done.docx", &["x"]));
    harness.run_pending(&documents(&harness));

    let err = harness
        .service
        .update_status(&StatusUpdate {
            document_id: TestHarness::public_id(&item),
            status: "PENDING".to_string(),
            retries_count: None,
        })
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::Intake(IntakeError::InvalidTransition { .. })
    ));
}

#[test]
fn test_processed_uploads_fill_shard_leaves_in_order() {
    // Each processed upload adds its artifact to the leaf; the first one
    // also adds the thumb directory.
    let harness = TestHarness::with_config(|b| b.max_items_per_layer(3));
    let registry = documents(&harness);

    let leaves: Vec<PathBuf> = (0..3)
        .map(|i| {
            let item = harness.upload_one(docx_upload(&format!("doc{}.docx", i), &["x"]));
            harness.run_pending(&registry);
            harness
                .job(&item)
                .payload
                .destination_path
                .parent()
                .unwrap()
                .to_path_buf()
        })
        .collect();

    assert_eq!(leaves[0], leaves[1]);
    assert_ne!(leaves[1], leaves[2]);
    for leaf in &leaves {
        let depth = leaf.strip_prefix(&harness.storage_root).unwrap().components().count();
        assert_eq!(depth, 5);
    }
}

fn assert_empty_leaf(harness: &TestHarness, destination: &Path) {
    assert!(!destination.exists());
    let thumb_dir = destination.parent().unwrap().join("thumb");
    let leftovers = std::fs::read_dir(&thumb_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "thumbnails left in {}", thumb_dir.display());
    assert!(destination.starts_with(&harness.storage_root));
}
