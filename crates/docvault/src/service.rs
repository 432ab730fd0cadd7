//! The operations callers use: upload, status polling, file resolution,
//! listing and reconciliation. Transport layers wrap this type.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::config::Config;
use crate::db::document_repo::{self, DocumentFilter, DocumentRow, DocumentStatus};
use crate::db::Database;
use crate::detect::FileCategory;
use crate::dispatch::{Dispatcher, Wakeups};
use crate::error::{IntakeError, VaultError};
use crate::intake::{self, IntakeOutcome, IntakePolicy, Rejection, UploadedFile};
use crate::processor::ProcessorRegistry;
use crate::queue::{JobQueue, JobState};
use crate::sanitize::is_public_id;
use crate::storage::filesystem::{remove_artifact, safe_delete};
use crate::storage::StorageAllocator;
use crate::worker::{JobRunner, PoolOptions, StalledJobWatchdog, WorkerPool};

pub const PAGE_SIZE: u64 = 20;

const RESULT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum UploadError {
    /// At least one file failed validation and the policy refuses the batch.
    #[error("{} file(s) rejected", rejected.len())]
    Rejected { rejected: Vec<Rejection> },

    #[error(transparent)]
    Intake(#[from] IntakeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
    pub file_type: u8,
    pub status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub items: Vec<UploadItem>,
    /// Files a lenient policy let the rest of the batch through without.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: String,
    pub name: String,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

/// Outcome of looking up a stored artifact by public id.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready { path: PathBuf, mime_type: String },
    NotFound,
    /// The document exists but no worker has finished it.
    NotProcessed,
    InternalError(String),
}

impl Resolution {
    /// Numeric code for transports that only carry a number: 0 when ready,
    /// otherwise -1, -2 or -3.
    pub fn code(&self) -> i32 {
        match self {
            Resolution::Ready { .. } => 0,
            Resolution::NotFound => -1,
            Resolution::NotProcessed => -2,
            Resolution::InternalError(_) => -3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPage {
    pub documents: Vec<DocumentRow>,
    pub total_count: u64,
    pub total_pages: u64,
    pub page_no: u64,
    pub page_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentName {
    pub document_encrypted_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Public id of the document.
    pub document_id: String,
    pub status: String,
    #[serde(default)]
    pub retries_count: Option<i64>,
}

pub struct VaultService {
    config: Arc<Config>,
    db: Database,
    queue: JobQueue,
    dispatcher: Dispatcher,
    progress: JobProgressBroadcaster,
}

impl VaultService {
    /// Opens the configured database and storage root.
    pub fn open(config: Config) -> Result<Self, VaultError> {
        let db = Database::open(&config.resolved_database_path())?;
        Self::with_database(config, db)
    }

    pub fn with_database(config: Config, db: Database) -> Result<Self, VaultError> {
        crate::storage::filesystem::ensure_directory(&config.storage_root)?;

        let queue = JobQueue::new(db.clone(), &config.queue);
        let allocator = StorageAllocator::new(
            config.storage_root.clone(),
            db.clone(),
            config.shard.max_items_per_layer,
            Duration::from_secs(config.shard.cache_ttl_secs),
        );
        let dispatcher = Dispatcher::new(
            db.clone(),
            queue.clone(),
            allocator,
            config.temp_dir(),
            Wakeups::new(),
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            queue,
            dispatcher,
            progress: JobProgressBroadcaster::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn file_link(&self, encrypted_id: &str) -> String {
        format!(
            "{}/api/file/v1/files/{}",
            self.config.public_base_url.trim_end_matches('/'),
            encrypted_id
        )
    }

    pub fn thumb_link(&self, encrypted_id: &str) -> String {
        format!(
            "{}/api/file/v1/thumb/{}",
            self.config.public_base_url.trim_end_matches('/'),
            encrypted_id
        )
    }

    /// Validates, stores and queues a batch of uploads.
    ///
    /// Files that pass intake but cannot be stored are reported per item with
    /// status `error`; they never abort the rest of the batch.
    pub fn upload(
        &self,
        files: Vec<UploadedFile>,
        policy: &IntakePolicy,
    ) -> Result<UploadResponse, UploadError> {
        let (accepted, rejected) = match intake::validate_batch(files, policy, &self.config.limits)? {
            IntakeOutcome::Accepted { files, rejected } => (files, rejected),
            IntakeOutcome::Rejected(rejected) => return Err(UploadError::Rejected { rejected }),
        };

        let items = accepted
            .iter()
            .map(|file| match self.dispatcher.dispatch(file) {
                Ok(dispatched) => UploadItem {
                    name: file.original_name.clone(),
                    job_id: Some(dispatched.job_id),
                    link: Some(self.file_link(&dispatched.encrypted_id)),
                    thumb: Some(self.thumb_link(&dispatched.encrypted_id)),
                    file_type: file.category.id(),
                    status: UploadStatus::Queued,
                    error: None,
                },
                Err(e) => {
                    log::error!("Failed to store upload '{}': {}", file.original_name, e);
                    UploadItem {
                        name: file.original_name.clone(),
                        job_id: None,
                        link: None,
                        thumb: None,
                        file_type: file.category.id(),
                        status: UploadStatus::Error,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        Ok(UploadResponse { items, rejected })
    }

    /// Status of a job in `category`'s queue. A job id from another queue is
    /// not found.
    pub fn job_status(
        &self,
        job_id: &str,
        category: FileCategory,
    ) -> Result<Option<JobStatusView>, VaultError> {
        let view = self
            .queue
            .find(job_id)?
            .filter(|job| job.category == category)
            .map(|job| JobStatusView {
                id: job.id,
                name: job.payload.display_name,
                state: job.state,
                progress: job.progress,
                result: job.result,
                failed_reason: job.failed_reason,
            });
        Ok(view)
    }

    pub fn resolve_file(&self, encrypted_id: &str) -> Resolution {
        self.resolve(encrypted_id, false)
    }

    pub fn resolve_thumbnail(&self, encrypted_id: &str) -> Resolution {
        self.resolve(encrypted_id, true)
    }

    fn resolve(&self, encrypted_id: &str, thumbnail: bool) -> Resolution {
        if !is_public_id(encrypted_id) {
            return Resolution::InternalError("malformed document id".to_string());
        }

        let document = match document_repo::find_by_public_id(&self.db, encrypted_id) {
            Ok(Some(document)) => document,
            Ok(None) => return Resolution::NotFound,
            Err(e) => {
                log::error!("Error resolving document path: {}", e);
                return Resolution::InternalError(e.to_string());
            }
        };

        if !document.is_processed {
            return Resolution::NotProcessed;
        }

        let path = if thumbnail {
            document.thumb_path.as_deref()
        } else {
            document.document_path.as_deref()
        };
        match path {
            Some(path) => {
                let path = PathBuf::from(path);
                let mime_type = if thumbnail {
                    mime_guess::from_path(&path)
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string()
                } else {
                    artifact_mime_type(&document)
                };
                Resolution::Ready { path, mime_type }
            }
            None => Resolution::InternalError("processed document has no stored path".to_string()),
        }
    }

    /// One page of documents, newest first. `doc_type` 0 means every type.
    pub fn list_documents(&self, page_no: u64, doc_type: i64) -> Result<DocumentPage, VaultError> {
        self.page(page_no, doc_type, None)
    }

    /// Case-insensitive name search, paginated like [`Self::list_documents`].
    pub fn search_documents(
        &self,
        query: &str,
        page_no: u64,
        doc_type: i64,
    ) -> Result<DocumentPage, VaultError> {
        self.page(page_no, doc_type, Some(query.to_string()))
    }

    fn page(
        &self,
        page_no: u64,
        doc_type: i64,
        name_contains: Option<String>,
    ) -> Result<DocumentPage, VaultError> {
        if page_no < 1 {
            return Err(IntakeError::InvalidPage("page numbers start at 1".to_string()).into());
        }
        let document_type = match doc_type {
            0 => None,
            id => Some(FileCategory::from_id(id).ok_or_else(|| {
                IntakeError::InvalidPage(format!("unknown document type {}", id))
            })?),
        };

        let filter = DocumentFilter {
            document_type,
            name_contains,
            status: None,
            limit: Some(PAGE_SIZE),
            offset: Some((page_no - 1) * PAGE_SIZE),
        };
        let (documents, total_count) = document_repo::query(&self.db, &filter)?;

        Ok(DocumentPage {
            documents,
            total_count,
            total_pages: total_count.div_ceil(PAGE_SIZE),
            page_no,
            page_size: PAGE_SIZE,
        })
    }

    pub fn get_document(&self, encrypted_id: &str) -> Result<Option<DocumentRow>, VaultError> {
        if !is_public_id(encrypted_id) {
            return Ok(None);
        }
        Ok(document_repo::find_by_public_id(&self.db, encrypted_id)?)
    }

    /// Display names for the given public ids; unknown ids are left out.
    pub fn file_names_by_ids(&self, encrypted_ids: &[String]) -> Result<Vec<DocumentName>, VaultError> {
        let ids: Vec<String> = encrypted_ids
            .iter()
            .filter(|id| is_public_id(id))
            .cloned()
            .collect();
        let names = document_repo::names_by_public_ids(&self.db, &ids)?
            .into_iter()
            .map(|(document_encrypted_id, display_name)| DocumentName {
                document_encrypted_id,
                display_name,
            })
            .collect();
        Ok(names)
    }

    /// Removes a document, its artifacts and any job still waiting for it.
    /// Returns the deleted id, or `None` if there was nothing to delete.
    pub fn delete_document(&self, encrypted_id: &str) -> Result<Option<String>, VaultError> {
        let Some(document) = self.get_document(encrypted_id)? else {
            return Ok(None);
        };

        if let Some(job) = self.queue.find_for_document(document.id)? {
            if job.state == JobState::Waiting {
                safe_delete(&job.payload.input_path);
            }
        }
        let discarded = self.queue.discard_waiting_for_document(document.id)?;

        document_repo::delete(&self.db, document.id)?;

        for path in [&document.document_path, &document.thumb_path]
            .into_iter()
            .flatten()
        {
            remove_artifact(std::path::Path::new(path));
        }

        log::info!(
            "Deleted document {} ({} waiting job(s) discarded)",
            document.id,
            discarded
        );
        Ok(Some(document.document_encrypted_id))
    }

    /// Reconciliation hook. Only moves along the status graph; resetting a
    /// FAILED document to PENDING does not queue it again.
    pub fn update_status(&self, request: &StatusUpdate) -> Result<DocumentRow, VaultError> {
        let next = DocumentStatus::parse(&request.status)
            .ok_or_else(|| IntakeError::UnknownStatus(request.status.clone()))?;
        let document = self
            .get_document(&request.document_id)?
            .ok_or_else(|| IntakeError::DocumentNotFound(request.document_id.clone()))?;

        if !document.status.can_transition_to(next) {
            return Err(IntakeError::InvalidTransition {
                from: document.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }

        document_repo::update_status(&self.db, document.id, next, request.retries_count)?;
        tracing::info!(
            document_id = document.id,
            from = %document.status,
            to = %next,
            "Document status updated"
        );

        document_repo::find_by_id(&self.db, document.id)?
            .ok_or_else(|| IntakeError::DocumentNotFound(request.document_id.clone()).into())
    }

    pub fn unprocessed_documents(&self, batch: u64) -> Result<Vec<DocumentRow>, VaultError> {
        Ok(document_repo::find_unprocessed(&self.db, batch)?)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.progress.subscribe()
    }

    /// Starts one pool per registered processor plus the stalled-job watchdog.
    pub fn start_workers(&self, processors: &ProcessorRegistry) -> Result<WorkerSet, VaultError> {
        let mut pools = Vec::new();

        for category in processors.categories() {
            let Some(processor) = processors.get(category) else {
                continue;
            };
            let runner = Arc::new(JobRunner::new(
                self.db.clone(),
                self.queue.clone(),
                processor,
                self.progress.clone(),
            ));
            let options = PoolOptions {
                concurrency: self.config.workers.concurrency(category),
                poll_interval: Duration::from_millis(self.config.queue.poll_interval_ms.max(1)),
                wakeup: self.dispatcher.wakeups().receiver(category),
                result_capacity: RESULT_BUFFER,
            };
            pools.push(WorkerPool::start(category, self.queue.clone(), runner, options)?);
        }

        let watchdog = StalledJobWatchdog::start(
            self.db.clone(),
            self.queue.clone(),
            Duration::from_secs(self.config.queue.stalled_interval_secs.max(1)),
        )?;

        Ok(WorkerSet { pools, watchdog })
    }
}

/// MIME type of the stored artifact, which differs from the upload for
/// re-encoded categories.
fn artifact_mime_type(document: &DocumentRow) -> String {
    match document.document_type {
        FileCategory::Image => "image/jpeg".to_string(),
        FileCategory::Audio => "audio/mpeg".to_string(),
        FileCategory::Pdf => "application/pdf".to_string(),
        FileCategory::Document => "application/gzip".to_string(),
    }
}

/// Running worker pools and the watchdog.
pub struct WorkerSet {
    pools: Vec<WorkerPool>,
    watchdog: StalledJobWatchdog,
}

impl WorkerSet {
    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    pub fn pool(&self, category: FileCategory) -> Option<&WorkerPool> {
        self.pools.iter().find(|p| p.category() == category)
    }

    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown();
        }
        self.watchdog.shutdown();
    }

    pub fn wait(self) {
        for pool in self.pools {
            pool.wait();
        }
        self.watchdog.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> VaultService {
        let config = Config::new(dir.path().join("uploads"));
        VaultService::with_database(config, Database::open_in_memory().unwrap()).unwrap()
    }

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRpayload";

    #[test]
    fn test_resolution_codes() {
        assert_eq!(Resolution::NotFound.code(), -1);
        assert_eq!(Resolution::NotProcessed.code(), -2);
        assert_eq!(Resolution::InternalError("x".to_string()).code(), -3);
    }

    #[test]
    fn test_upload_response_shape() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let response = service
            .upload(
                vec![UploadedFile::new("logo.png", Some("image/png"), PNG.to_vec())],
                &IntakePolicy::strict(),
            )
            .unwrap();

        assert_eq!(response.items.len(), 1);
        let item = &response.items[0];
        assert_eq!(item.status, UploadStatus::Queued);
        assert_eq!(item.file_type, 1);
        assert!(item.job_id.as_deref().unwrap().starts_with("image-"));
        assert!(item
            .link
            .as_deref()
            .unwrap()
            .starts_with("http://localhost:8080/api/file/v1/files/"));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["items"][0]["fileType"], 1);
        assert_eq!(json["items"][0]["status"], "queued");
        assert!(json.get("rejected").is_none());
    }

    #[test]
    fn test_empty_upload_is_an_intake_error() {
        let dir = TempDir::new().unwrap();
        let err = service(&dir)
            .upload(Vec::new(), &IntakePolicy::strict())
            .unwrap_err();
        assert!(matches!(err, UploadError::Intake(IntakeError::NoFiles)));
    }

    #[test]
    fn test_unprocessed_document_resolves_not_processed() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let response = service
            .upload(
                vec![UploadedFile::new("logo.png", Some("image/png"), PNG.to_vec())],
                &IntakePolicy::strict(),
            )
            .unwrap();
        let link = response.items[0].link.clone().unwrap();
        let id = link.rsplit('/').next().unwrap();

        assert_eq!(service.resolve_file(id), Resolution::NotProcessed);
        assert_eq!(service.resolve_thumbnail(id), Resolution::NotProcessed);
        assert!(matches!(
            service.resolve_file("../../etc/passwd"),
            Resolution::InternalError(_)
        ));
    }

    #[test]
    fn test_processed_document_resolves_both_artifacts() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service
            .upload(
                vec![UploadedFile::new("logo.png", Some("image/png"), PNG.to_vec())],
                &IntakePolicy::strict(),
            )
            .unwrap();
        let page = service.list_documents(1, 0).unwrap();
        let row = &page.documents[0];
        let id = row.document_encrypted_id.clone();

        document_repo::mark_processing(&service.db, row.id).unwrap();
        document_repo::complete(
            &service.db,
            row.id,
            &document_repo::CompletedArtifacts {
                document_path: "/srv/leaf/1-logo.jpg".to_string(),
                thumb_path: "/srv/leaf/thumb/1-logo_thumb.jpg".to_string(),
                size_mb: 0.01,
            },
        )
        .unwrap();

        assert_eq!(
            service.resolve_file(&id),
            Resolution::Ready {
                path: PathBuf::from("/srv/leaf/1-logo.jpg"),
                mime_type: "image/jpeg".to_string(),
            }
        );
        assert_eq!(
            service.resolve_thumbnail(&id),
            Resolution::Ready {
                path: PathBuf::from("/srv/leaf/thumb/1-logo_thumb.jpg"),
                mime_type: "image/jpeg".to_string(),
            }
        );
    }

    #[test]
    fn test_job_status_checks_category() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let response = service
            .upload(
                vec![UploadedFile::new("logo.png", Some("image/png"), PNG.to_vec())],
                &IntakePolicy::strict(),
            )
            .unwrap();
        let job_id = response.items[0].job_id.clone().unwrap();

        let status = service
            .job_status(&job_id, FileCategory::Image)
            .unwrap()
            .unwrap();
        assert_eq!(status.name, "logo.png");
        assert_eq!(status.state, JobState::Waiting);
        assert_eq!(status.progress, 0);
        assert!(service
            .job_status(&job_id, FileCategory::Pdf)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_paging_and_search() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let files = (0..25)
            .map(|i| UploadedFile::new(format!("Photo {}.png", i), Some("image/png"), PNG.to_vec()))
            .collect();
        service.upload(files, &IntakePolicy::strict()).unwrap();

        let first = service.list_documents(1, 0).unwrap();
        assert_eq!(first.total_count, 25);
        assert_eq!(first.total_pages, 2);
        assert_eq!(first.documents.len(), 20);
        assert_eq!(first.documents[0].display_name, "Photo 24.png");

        let second = service.list_documents(2, 1).unwrap();
        assert_eq!(second.documents.len(), 5);
        assert_eq!(service.list_documents(1, 3).unwrap().total_count, 0);

        let found = service.search_documents("photo 1", 1, 0).unwrap();
        assert_eq!(found.total_count, 11);

        assert!(service.list_documents(0, 0).is_err());
        assert!(service.list_documents(1, 9).is_err());
    }

    #[test]
    fn test_update_status_follows_transition_graph() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service
            .upload(
                vec![UploadedFile::new("logo.png", Some("image/png"), PNG.to_vec())],
                &IntakePolicy::strict(),
            )
            .unwrap();
        let id = service.list_documents(1, 0).unwrap().documents[0]
            .document_encrypted_id
            .clone();

        let request = |status: &str, retries: Option<i64>| StatusUpdate {
            document_id: id.clone(),
            status: status.to_string(),
            retries_count: retries,
        };

        assert!(matches!(
            service.update_status(&request("COMPLETED", None)),
            Err(VaultError::Intake(IntakeError::InvalidTransition { .. }))
        ));
        assert!(matches!(
            service.update_status(&request("DONE", None)),
            Err(VaultError::Intake(IntakeError::UnknownStatus(_)))
        ));

        let failed = service.update_status(&request("failed", None)).unwrap();
        assert_eq!(failed.status, DocumentStatus::Failed);
        assert!(!failed.is_processed);

        let reset = service.update_status(&request("PENDING", Some(0))).unwrap();
        assert_eq!(reset.status, DocumentStatus::Pending);
        assert_eq!(reset.retries_count, 0);
    }

    #[test]
    fn test_file_names_skip_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service
            .upload(
                vec![UploadedFile::new("logo.png", Some("image/png"), PNG.to_vec())],
                &IntakePolicy::strict(),
            )
            .unwrap();
        let id = service.list_documents(1, 0).unwrap().documents[0]
            .document_encrypted_id
            .clone();

        let names = service
            .file_names_by_ids(&[id.clone(), "z".repeat(64), "bad id".to_string()])
            .unwrap();
        assert_eq!(
            names,
            vec![DocumentName {
                document_encrypted_id: id,
                display_name: "logo.png".to_string(),
            }]
        );
    }
}
