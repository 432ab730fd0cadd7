use std::time::Duration;

use crate::detect::FileCategory;

/// How one attempt at a queue job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        document_path: String,
        thumb_path: String,
        size_mb: f64,
    },
    /// Nothing to do: the document is gone, already finished or no longer
    /// accepts processing. The job was closed without touching artifacts.
    Skipped { reason: String },
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed { error: String },
    /// The job lost its lock while running and belongs to someone else now.
    Lost { error: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. } | JobOutcome::Skipped { .. })
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub document_id: i64,
    pub category: FileCategory,
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn new(
        job_id: impl Into<String>,
        document_id: i64,
        category: FileCategory,
        outcome: JobOutcome,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            document_id,
            category,
            outcome,
        }
    }
}
