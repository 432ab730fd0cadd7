//! Durable per-category job queues.
//!
//! One logical queue per [`FileCategory`], all stored in `queue_jobs`. Jobs
//! move waiting → active → completed | failed; a failed attempt with
//! attempts left goes back to waiting with an exponential delay.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::db::queue_repo::{self, NewJobRow, QueueJobRow};
use crate::db::{now_millis, Database};
use crate::detect::FileCategory;
use crate::error::QueueError;

pub use crate::db::queue_repo::StalledSweep;

/// Upper bound on a single retry delay.
const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker needs to process one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    /// Temporary copy of the upload.
    pub input_path: PathBuf,
    /// Final artifact path inside the allocated leaf.
    pub destination_path: PathBuf,
    pub thumb_dir: PathBuf,
    pub display_name: String,
}

/// A decoded queue job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueJob {
    pub id: String,
    pub category: FileCategory,
    pub document_id: i64,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub stalled_count: u32,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl QueueJob {
    /// Whether a failure of the attempt now running would be the last one.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.max_attempts
    }
}

impl TryFrom<QueueJobRow> for QueueJob {
    type Error = QueueError;

    fn try_from(row: QueueJobRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| QueueError::InvalidPayload {
            id: row.id.clone(),
            reason,
        };

        let category = FileCategory::from_queue_name(&row.queue)
            .ok_or_else(|| QueueError::UnknownQueue(row.queue.clone()))?;
        let state = JobState::parse(&row.state)
            .ok_or_else(|| invalid(format!("unknown state '{}'", row.state)))?;
        let payload: JobPayload =
            serde_json::from_str(&row.payload).map_err(|e| invalid(e.to_string()))?;
        let result = match row.result.as_deref() {
            Some(text) => Some(serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?),
            None => None,
        };

        Ok(Self {
            category,
            document_id: row.document_id,
            payload,
            state,
            attempts_made: row.attempts_made.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            progress: row.progress.clamp(0, 100) as u8,
            result,
            failed_reason: row.failed_reason,
            stalled_count: row.stalled_count.max(0) as u32,
            created_at: row.created_at,
            finished_at: row.finished_at,
            id: row.id,
        })
    }
}

/// Exponential retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the next try after `failures` failed attempts:
    /// `backoff_delay * 2^(failures - 1)`, capped.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let base = self.backoff_delay.as_millis() as u64;
        let factor = 2_u64.saturating_pow(failures.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in line; `attempt` is the number of failures so far.
    Retrying { attempt: u32, delay: Duration },
    Failed,
    /// The job was no longer active (requeued by the stall sweep meanwhile).
    Lost,
}

/// Deterministic job id. The millisecond suffix keeps re-submissions of the
/// same document distinct while the prefix groups them.
pub fn job_id(category: FileCategory, document_id: i64, millis: i64) -> String {
    format!("{}-{}-{}", category, document_id, millis)
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    policy: RetryPolicy,
    remove_on_complete: u64,
    remove_on_fail: u64,
    lock_duration: Duration,
    max_stalled_count: u32,
}

impl JobQueue {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            db,
            policy: RetryPolicy {
                attempts: config.attempts.max(1),
                backoff_delay: Duration::from_millis(config.backoff_delay_ms),
            },
            remove_on_complete: config.remove_on_complete as u64,
            remove_on_fail: config.remove_on_fail as u64,
            lock_duration: Duration::from_secs(config.lock_duration_secs),
            max_stalled_count: config.max_stalled_count,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    /// Adds a job on an open connection so the caller can make it part of a
    /// larger transaction. Re-adding an existing id is a no-op.
    pub fn enqueue_in(
        &self,
        conn: &Connection,
        category: FileCategory,
        document_id: i64,
        payload: &JobPayload,
    ) -> Result<String, QueueError> {
        let now = now_millis();
        let id = job_id(category, document_id, now);
        let payload_json = serde_json::to_string(payload).map_err(|e| QueueError::InvalidPayload {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        let inserted = queue_repo::insert_in(
            conn,
            &NewJobRow {
                id: id.clone(),
                queue: category.queue_name().to_string(),
                document_id,
                payload: payload_json,
                max_attempts: self.policy.attempts as i64,
                backoff_delay_ms: self.policy.backoff_delay.as_millis() as i64,
                now,
            },
        )?;
        if !inserted {
            tracing::debug!(job_id = %id, "Job already queued");
        }
        Ok(id)
    }

    pub fn enqueue(
        &self,
        category: FileCategory,
        document_id: i64,
        payload: &JobPayload,
    ) -> Result<String, QueueError> {
        self.db
            .with_conn(|conn| Ok(self.enqueue_in(conn, category, document_id, payload)))?
    }

    /// Claims the oldest due job of `category`.
    ///
    /// A row whose payload cannot be decoded is failed on the spot so it
    /// does not block the queue.
    pub fn claim(&self, category: FileCategory) -> Result<Option<QueueJob>, QueueError> {
        let now = now_millis();
        let Some(row) = queue_repo::claim_next(&self.db, category.queue_name(), now)? else {
            return Ok(None);
        };

        let id = row.id.clone();
        match QueueJob::try_from(row) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Discarding undecodable job");
                queue_repo::fail(&self.db, &id, &e.to_string(), now)?;
                Err(e)
            }
        }
    }

    /// Records progress and renews the job's lock.
    pub fn report_progress(&self, job_id: &str, progress: u8) -> Result<bool, QueueError> {
        Ok(queue_repo::update_progress(
            &self.db,
            job_id,
            progress.min(100) as i64,
            now_millis(),
        )?)
    }

    pub fn complete(&self, job: &QueueJob, result: &serde_json::Value) -> Result<bool, QueueError> {
        let done = queue_repo::complete(&self.db, &job.id, &result.to_string(), now_millis())?;
        queue_repo::prune(
            &self.db,
            job.category.queue_name(),
            JobState::Completed.as_str(),
            self.remove_on_complete,
        )?;
        Ok(done)
    }

    /// Records a failed attempt. Retryable failures with attempts left go
    /// back in line with backoff; everything else fails the job.
    pub fn fail(&self, job: &QueueJob, reason: &str, retryable: bool) -> Result<FailOutcome, QueueError> {
        let now = now_millis();
        let failures = job.attempts_made + 1;

        if retryable && failures < job.max_attempts {
            let delay = self.policy.delay_after(failures);
            let available_at = now + delay.as_millis() as i64;
            if !queue_repo::retry(&self.db, &job.id, reason, available_at)? {
                return Ok(FailOutcome::Lost);
            }
            return Ok(FailOutcome::Retrying {
                attempt: failures,
                delay,
            });
        }

        if !queue_repo::fail(&self.db, &job.id, reason, now)? {
            return Ok(FailOutcome::Lost);
        }
        queue_repo::prune(
            &self.db,
            job.category.queue_name(),
            JobState::Failed.as_str(),
            self.remove_on_fail,
        )?;
        Ok(FailOutcome::Failed)
    }

    /// Puts back (or fails) active jobs whose lock has expired.
    pub fn requeue_stalled(&self) -> Result<StalledSweep, QueueError> {
        let now = now_millis();
        let cutoff = now - self.lock_duration.as_millis() as i64;
        Ok(queue_repo::requeue_stalled(
            &self.db,
            cutoff,
            self.max_stalled_count as i64,
            now,
        )?)
    }

    pub fn find(&self, job_id: &str) -> Result<Option<QueueJob>, QueueError> {
        queue_repo::find_by_id(&self.db, job_id)?
            .map(QueueJob::try_from)
            .transpose()
    }

    pub fn find_for_document(&self, document_id: i64) -> Result<Option<QueueJob>, QueueError> {
        queue_repo::find_latest_for_document(&self.db, document_id)?
            .map(QueueJob::try_from)
            .transpose()
    }

    pub fn counts(&self, category: FileCategory) -> Result<Vec<(JobState, u64)>, QueueError> {
        let rows = queue_repo::count_by_state(&self.db, category.queue_name())?;
        Ok(rows
            .into_iter()
            .filter_map(|(state, n)| JobState::parse(&state).map(|s| (s, n)))
            .collect())
    }

    pub fn discard_waiting_for_document(&self, document_id: i64) -> Result<usize, QueueError> {
        Ok(queue_repo::delete_waiting_for_document(&self.db, document_id)?)
    }
}
