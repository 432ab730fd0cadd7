//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::detect::FileCategory;

/// Phase of job processing. The checkpoint phases carry the progress value
/// stored on the queue job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Started,
    DirectoryReady,
    Transformed,
    Thumbnailed,
    RegistryUpdated,
    Completed,
    Retrying,
    Failed,
}

impl JobPhase {
    /// Progress checkpoint reached when this phase is entered.
    pub fn checkpoint(self) -> Option<u8> {
        match self {
            JobPhase::Started => Some(0),
            JobPhase::DirectoryReady => Some(20),
            JobPhase::Transformed => Some(60),
            JobPhase::Thumbnailed => Some(80),
            JobPhase::RegistryUpdated => Some(90),
            JobPhase::Completed => Some(100),
            JobPhase::Retrying | JobPhase::Failed => None,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Started => write!(f, "Started"),
            JobPhase::DirectoryReady => write!(f, "Directory ready"),
            JobPhase::Transformed => write!(f, "Transformed"),
            JobPhase::Thumbnailed => write!(f, "Thumbnail written"),
            JobPhase::RegistryUpdated => write!(f, "Registry updated"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Retrying => write!(f, "Retrying"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Overall status carried by an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub document_id: i64,
    pub category: FileCategory,
    /// Display name of the upload.
    pub filename: String,
    pub phase: JobPhase,
    pub status: JobStatus,
    /// Last checkpoint reached, 0 to 100.
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one attempt at a job and announces it.
    pub fn start_job(
        &self,
        job_id: &str,
        document_id: i64,
        category: FileCategory,
        filename: &str,
    ) -> JobProgressTracker {
        let tracker = JobProgressTracker {
            job_id: job_id.to_string(),
            document_id,
            category,
            filename: filename.to_string(),
            sender: Arc::clone(&self.sender),
        };
        tracker.update_phase(JobPhase::Started, "Processing started");
        tracker
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Tracks progress for a single job attempt.
pub struct JobProgressTracker {
    job_id: String,
    document_id: i64,
    category: FileCategory,
    filename: String,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    fn event(&self, phase: JobPhase, progress: u8, message: &str) -> JobProgressEvent {
        let status = match phase {
            JobPhase::Completed => JobStatus::Completed,
            JobPhase::Failed => JobStatus::Failed,
            _ => JobStatus::Processing,
        };

        JobProgressEvent {
            job_id: self.job_id.clone(),
            document_id: self.document_id,
            category: self.category,
            filename: self.filename.clone(),
            phase,
            status,
            progress,
            message: message.to_string(),
            timestamp: Utc::now(),
            document_path: None,
            thumb_path: None,
            error: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Announces a checkpoint phase.
    pub fn update_phase(&self, phase: JobPhase, message: &str) {
        let progress = phase.checkpoint().unwrap_or(0);
        let _ = self.sender.send(self.event(phase, progress, message));
    }

    pub fn completed(&self, document_path: &str, thumb_path: &str) {
        let mut event = self.event(JobPhase::Completed, 100, "Processing completed successfully");
        event.document_path = Some(document_path.to_string());
        event.thumb_path = Some(thumb_path.to_string());
        let _ = self.sender.send(event);
    }

    pub fn retrying(&self, error: &str, attempt: u32) {
        let mut event = self.event(
            JobPhase::Retrying,
            0,
            &format!("Attempt {} failed, retry scheduled", attempt),
        );
        event.error = Some(error.to_string());
        let _ = self.sender.send(event);
    }

    pub fn failed(&self, error: &str) {
        let mut event = self.event(JobPhase::Failed, 0, "Processing failed");
        event.error = Some(error.to_string());
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoints_increase() {
        let phases = [
            JobPhase::Started,
            JobPhase::DirectoryReady,
            JobPhase::Transformed,
            JobPhase::Thumbnailed,
            JobPhase::RegistryUpdated,
            JobPhase::Completed,
        ];
        let values: Vec<u8> = phases.iter().filter_map(|p| p.checkpoint()).collect();
        assert_eq!(values, vec![0, 20, 60, 80, 90, 100]);
        assert_eq!(JobPhase::Failed.checkpoint(), None);
    }

    #[test]
    fn test_start_job_announces() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let tracker = broadcaster.start_job("image-1-1", 1, FileCategory::Image, "a.jpg");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, "image-1-1");
        assert_eq!(received.phase, JobPhase::Started);
        assert_eq!(received.status, JobStatus::Processing);

        tracker.update_phase(JobPhase::Transformed, "Image re-encoded");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.progress, 60);
        assert_eq!(received.message, "Image re-encoded");
    }

    #[test]
    fn test_job_completion() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let tracker = broadcaster.start_job("pdf-2-1", 2, FileCategory::Pdf, "invoice.pdf");
        let _ = rx.try_recv();

        tracker.completed("/u/A/B/C/D/E/2-invoice.pdf", "/u/A/B/C/D/E/thumb/2-invoice.jpg");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.status, JobStatus::Completed);
        assert_eq!(received.progress, 100);
        assert_eq!(
            received.document_path.as_deref(),
            Some("/u/A/B/C/D/E/2-invoice.pdf")
        );
    }

    #[test]
    fn test_job_failure_and_retry() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let tracker = broadcaster.start_job("audio-3-1", 3, FileCategory::Audio, "a.wav");
        let _ = rx.try_recv();

        tracker.retrying("ffmpeg exited with 1", 1);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.phase, JobPhase::Retrying);
        assert_eq!(received.status, JobStatus::Processing);

        tracker.failed("ffmpeg exited with 1");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.status, JobStatus::Failed);
        assert_eq!(received.error.as_deref(), Some("ffmpeg exited with 1"));
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = JobProgressBroadcaster::default();
        let tracker = broadcaster.start_job("x", 1, FileCategory::Document, "a.doc");
        tracker.failed("nobody listening");
    }
}
