//! Runs one claimed queue job against its document.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::broadcast::{JobPhase, JobProgressBroadcaster, JobProgressTracker};
use crate::db::document_repo::{self, CompletedArtifacts, DocumentStatus};
use crate::db::Database;
use crate::error::{ProcessError, VaultError};
use crate::processor::{write_error, MediaProcessor, WorkItem};
use crate::queue::{FailOutcome, JobQueue, QueueJob};
use crate::sanitize::redact_path;
use crate::storage::filesystem::{bytes_to_mb, remove_artifact, safe_delete};
use crate::worker::job::{JobOutcome, JobResult};

pub struct JobRunner {
    db: Database,
    queue: JobQueue,
    processor: Arc<dyn MediaProcessor>,
    progress: JobProgressBroadcaster,
}

struct Produced {
    output: PathBuf,
    thumb: PathBuf,
}

impl JobRunner {
    pub fn new(
        db: Database,
        queue: JobQueue,
        processor: Arc<dyn MediaProcessor>,
        progress: JobProgressBroadcaster,
    ) -> Self {
        Self {
            db,
            queue,
            processor,
            progress,
        }
    }

    /// Processes `job` to the end of this attempt and records the result on
    /// both the queue job and the document. Errors are infrastructure
    /// failures (database, queue); processing failures become outcomes.
    pub fn run(&self, job: &QueueJob) -> Result<JobResult, VaultError> {
        let _span = tracing::info_span!(
            "worker.job",
            job_id = %job.id,
            document_id = job.document_id,
            category = %job.category,
            attempt = job.attempts_made + 1
        )
        .entered();

        let tracker = self.progress.start_job(
            &job.id,
            job.document_id,
            job.category,
            &job.payload.display_name,
        );
        let result =
            |outcome: JobOutcome| JobResult::new(&job.id, job.document_id, job.category, outcome);

        let Some(document) = document_repo::find_by_id(&self.db, job.document_id)? else {
            tracing::warn!("Document no longer exists, closing job");
            safe_delete(&job.payload.input_path);
            return self.skip(job, &tracker, "document not found").map(result);
        };

        if document.status == DocumentStatus::Completed {
            tracing::info!("Document already completed, leaving artifacts in place");
            self.queue.complete(
                job,
                &json!({
                    "skipped": "already completed",
                    "documentPath": document.document_path,
                    "thumbPath": document.thumb_path,
                }),
            )?;
            tracker.update_phase(JobPhase::Completed, "Document was already completed");
            return Ok(result(JobOutcome::Skipped {
                reason: "already completed".to_string(),
            }));
        }

        if !document_repo::mark_processing(&self.db, job.document_id)? {
            let reason = format!("document is {}", document.status);
            tracing::warn!(status = %document.status, "Document does not accept processing");
            return self.skip(job, &tracker, &reason).map(result);
        }

        let produced = match self.produce(job, &tracker) {
            Ok(produced) => produced,
            Err(e) => return self.handle_failure(job, &tracker, e).map(result),
        };

        let size_mb = std::fs::metadata(&produced.output)
            .map(|m| bytes_to_mb(m.len()))
            .unwrap_or(0.0);
        let artifacts = CompletedArtifacts {
            document_path: produced.output.display().to_string(),
            thumb_path: produced.thumb.display().to_string(),
            size_mb,
        };

        if !document_repo::complete(&self.db, job.document_id, &artifacts)? {
            // Deleted or reset while we were converting.
            tracing::warn!("Document changed during processing, discarding artifacts");
            remove_artifact(&produced.output);
            remove_artifact(&produced.thumb);
            safe_delete(&job.payload.input_path);
            return self
                .skip(job, &tracker, "document changed during processing")
                .map(result);
        }
        self.checkpoint(job, &tracker, JobPhase::RegistryUpdated, "Registry updated");

        if !safe_delete(&job.payload.input_path) {
            tracing::warn!(
                input = %redact_path(&job.payload.input_path),
                "Temp input left behind"
            );
        }
        self.checkpoint(job, &tracker, JobPhase::Completed, "Temp input removed");

        self.queue.complete(
            job,
            &json!({
                "documentPath": artifacts.document_path,
                "thumbPath": artifacts.thumb_path,
                "sizeMb": artifacts.size_mb,
            }),
        )?;
        tracker.completed(&artifacts.document_path, &artifacts.thumb_path);
        log::info!(
            "Processed {} document {} ({} MB)",
            job.category,
            job.document_id,
            size_mb
        );

        Ok(result(JobOutcome::Completed {
            document_path: artifacts.document_path,
            thumb_path: artifacts.thumb_path,
            size_mb,
        }))
    }

    /// Directory set-up, conversion and thumbnail. Anything produced is
    /// removed again on failure.
    fn produce(&self, job: &QueueJob, tracker: &JobProgressTracker) -> Result<Produced, ProcessError> {
        let payload = &job.payload;
        if let Some(parent) = payload.destination_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
        }
        std::fs::create_dir_all(&payload.thumb_dir)
            .map_err(|e| write_error(&payload.thumb_dir, e))?;
        self.checkpoint(job, tracker, JobPhase::DirectoryReady, "Output directories ready");

        let item = WorkItem {
            input: &payload.input_path,
            output: &payload.destination_path,
            thumb_dir: &payload.thumb_dir,
            display_name: &payload.display_name,
        };

        if let Err(e) = self.processor.transform(&item) {
            remove_artifact(&payload.destination_path);
            return Err(e);
        }
        self.checkpoint(job, tracker, JobPhase::Transformed, "Artifact written");

        let thumb = match self.processor.thumbnail(&item) {
            Ok(path) => path,
            Err(e) => {
                remove_artifact(&payload.destination_path);
                return Err(e);
            }
        };
        self.checkpoint(job, tracker, JobPhase::Thumbnailed, "Thumbnail written");

        Ok(Produced {
            output: payload.destination_path.clone(),
            thumb,
        })
    }

    fn handle_failure(
        &self,
        job: &QueueJob,
        tracker: &JobProgressTracker,
        error: ProcessError,
    ) -> Result<JobOutcome, VaultError> {
        let reason = error.to_string();
        let retryable = error.is_retryable();
        tracing::warn!(error = %reason, retryable, "Processing attempt failed");

        match self.queue.fail(job, &reason, retryable)? {
            FailOutcome::Retrying { attempt, delay } => {
                // The temp input stays for the next attempt.
                document_repo::release_for_retry(&self.db, job.document_id)?;
                tracker.retrying(&reason, attempt);
                Ok(JobOutcome::Retrying {
                    attempt,
                    delay,
                    error: reason,
                })
            }
            FailOutcome::Failed => {
                document_repo::mark_failed(&self.db, job.document_id)?;
                safe_delete(&job.payload.input_path);
                tracker.failed(&reason);
                log::error!(
                    "Giving up on {} document {}: {}",
                    job.category,
                    job.document_id,
                    reason
                );
                Ok(JobOutcome::Failed { error: reason })
            }
            FailOutcome::Lost => {
                tracing::warn!("Job lock was lost, leaving the document to its new owner");
                Ok(JobOutcome::Lost { error: reason })
            }
        }
    }

    fn skip(
        &self,
        job: &QueueJob,
        tracker: &JobProgressTracker,
        reason: &str,
    ) -> Result<JobOutcome, VaultError> {
        self.queue.complete(job, &json!({ "skipped": reason }))?;
        tracker.update_phase(JobPhase::Completed, reason);
        Ok(JobOutcome::Skipped {
            reason: reason.to_string(),
        })
    }

    fn checkpoint(&self, job: &QueueJob, tracker: &JobProgressTracker, phase: JobPhase, message: &str) {
        if let Some(progress) = phase.checkpoint() {
            if let Err(e) = self.queue.report_progress(&job.id, progress) {
                tracing::warn!(error = %e, progress, "Failed to record job progress");
            }
        }
        tracker.update_phase(phase, message);
    }
}
