//! Stalled-job watchdog.
//!
//! A job stays `active` only while its worker keeps renewing the lock. When a
//! worker dies mid-job the lock expires and the sweep puts the job back in
//! line, or fails it once it has stalled too often.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::db::{document_repo, Database};
use crate::error::{VaultError, WorkerError};
use crate::queue::{JobQueue, StalledSweep};
use crate::storage::filesystem::safe_delete;

const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

/// Runs one sweep. Documents of jobs that stalled too often are marked
/// FAILED and their temp input is removed; requeued jobs leave both for the
/// next worker.
pub fn sweep(db: &Database, queue: &JobQueue) -> Result<StalledSweep, VaultError> {
    let result = queue.requeue_stalled()?;

    for job_id in &result.failed {
        let Some(job) = queue.find(job_id)? else {
            continue;
        };
        document_repo::mark_failed(db, job.document_id)?;
        safe_delete(&job.payload.input_path);
        tracing::error!(
            job_id = %job.id,
            document_id = job.document_id,
            "Job stalled too many times, document marked failed"
        );
    }
    for job_id in &result.requeued {
        tracing::warn!(job_id = %job_id, "Stalled job moved back to waiting");
    }

    Ok(result)
}

pub struct StalledJobWatchdog {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StalledJobWatchdog {
    pub fn start(db: Database, queue: JobQueue, interval: Duration) -> Result<Self, WorkerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("stalled-watchdog".to_string())
            .spawn(move || {
                log::debug!("Stalled-job watchdog started ({:?} interval)", interval);
                let mut next = Instant::now() + interval;
                while !flag.load(Ordering::Relaxed) {
                    if Instant::now() < next {
                        thread::sleep(SHUTDOWN_CHECK.min(interval));
                        continue;
                    }
                    if let Err(e) = sweep(&db, &queue) {
                        log::error!("Stalled-job sweep failed: {}", e);
                    }
                    next = Instant::now() + interval;
                }
                log::debug!("Stalled-job watchdog stopped");
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        Ok(Self { shutdown, handle })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        self.shutdown();
        if let Err(e) = self.handle.join() {
            log::error!("Stalled-job watchdog panicked: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::document_repo::{DocumentStatus, NewDocument};
    use crate::detect::FileCategory;
    use crate::queue::{JobPayload, JobState};
    use std::path::PathBuf;

    fn setup(max_stalled_count: u32) -> (Database, JobQueue, i64) {
        setup_with_input(max_stalled_count, PathBuf::from("/tmp/temp-1-scan.pdf"))
    }

    fn setup_with_input(max_stalled_count: u32, input_path: PathBuf) -> (Database, JobQueue, i64) {
        let db = Database::open_in_memory().unwrap();
        let queue = JobQueue::new(
            db.clone(),
            &QueueConfig {
                lock_duration_secs: 0,
                max_stalled_count,
                ..QueueConfig::default()
            },
        );
        let id = document_repo::insert(
            &db,
            &NewDocument {
                category: FileCategory::Pdf,
                display_name: "scan.pdf".to_string(),
                encrypted_id: "s".repeat(64),
                size_mb: 0.1,
                file_extension: "pdf".to_string(),
                mime_type: "application/pdf".to_string(),
            },
        )
        .unwrap();
        queue
            .enqueue(
                FileCategory::Pdf,
                id,
                &JobPayload {
                    input_path,
                    destination_path: PathBuf::from("/tmp/leaf/1-scan.pdf"),
                    thumb_dir: PathBuf::from("/tmp/leaf/thumb"),
                    display_name: "scan.pdf".to_string(),
                },
            )
            .unwrap();
        (db, queue, id)
    }

    #[test]
    fn test_expired_lock_is_requeued() {
        let (db, queue, id) = setup(3);
        let job = queue.claim(FileCategory::Pdf).unwrap().unwrap();
        document_repo::mark_processing(&db, id).unwrap();
        thread::sleep(Duration::from_millis(5));

        let result = sweep(&db, &queue).unwrap();
        assert_eq!(result.requeued, vec![job.id.clone()]);
        assert_eq!(queue.find(&job.id).unwrap().unwrap().state, JobState::Waiting);
        assert_eq!(
            document_repo::find_by_id(&db, id).unwrap().unwrap().status,
            DocumentStatus::Processing
        );
    }

    #[test]
    fn test_repeated_stalls_fail_the_document() {
        let (db, queue, id) = setup(0);
        let job = queue.claim(FileCategory::Pdf).unwrap().unwrap();
        document_repo::mark_processing(&db, id).unwrap();
        thread::sleep(Duration::from_millis(5));

        let result = sweep(&db, &queue).unwrap();
        assert_eq!(result.failed, vec![job.id.clone()]);
        assert_eq!(queue.find(&job.id).unwrap().unwrap().state, JobState::Failed);
        assert_eq!(
            document_repo::find_by_id(&db, id).unwrap().unwrap().status,
            DocumentStatus::Failed
        );
    }

    #[test]
    fn test_stall_failure_removes_temp_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp-1-scan.pdf");
        std::fs::write(&input, b"%PDF-1.4").unwrap();
        let (db, queue, id) = setup_with_input(0, input.clone());
        queue.claim(FileCategory::Pdf).unwrap().unwrap();
        document_repo::mark_processing(&db, id).unwrap();
        thread::sleep(Duration::from_millis(5));

        sweep(&db, &queue).unwrap();
        assert!(!input.exists());
    }

    #[test]
    fn test_expired_lock_keeps_temp_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("temp-1-scan.pdf");
        std::fs::write(&input, b"%PDF-1.4").unwrap();
        let (db, queue, _) = setup_with_input(3, input.clone());
        queue.claim(FileCategory::Pdf).unwrap().unwrap();
        thread::sleep(Duration::from_millis(5));

        sweep(&db, &queue).unwrap();
        assert!(input.exists());
    }

    #[test]
    fn test_watchdog_stops_promptly() {
        let (db, queue, _) = setup(3);
        let watchdog = StalledJobWatchdog::start(db, queue, Duration::from_secs(60)).unwrap();
        let started = Instant::now();
        watchdog.wait();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
