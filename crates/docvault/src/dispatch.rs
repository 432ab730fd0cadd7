//! Turns a validated upload into a Document row plus one queued job.
//!
//! The upload bytes go to the temp area first; the row insert and the
//! enqueue then share one transaction, so either both exist or neither does
//! (and the temp copy is removed).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::db::document_repo::{self, NewDocument};
use crate::db::{now_millis, Database};
use crate::detect::FileCategory;
use crate::error::{StorageError, VaultError};
use crate::intake::ValidatedFile;
use crate::queue::{JobPayload, JobQueue};
use crate::sanitize::{hash_path, sanitize_file_stem};
use crate::storage::filesystem::{remove_artifact, write_exclusive};
use crate::storage::StorageAllocator;

/// Random bytes behind a public document id (64 URL-safe characters).
const PUBLIC_ID_BYTES: usize = 48;

const WAKE_CAPACITY: usize = 64;

/// Generates the opaque id under which a Document is exposed.
pub fn generate_public_id() -> Result<String, StorageError> {
    let mut buf = [0u8; PUBLIC_ID_BYTES];
    getrandom::getrandom(&mut buf).map_err(|e| StorageError::Random(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Extension of the artifact a worker produces for `category`.
pub fn final_extension(category: FileCategory, detected_extension: &str) -> String {
    match category {
        FileCategory::Image => "jpg".to_string(),
        FileCategory::Audio => "mp3".to_string(),
        FileCategory::Pdf => "pdf".to_string(),
        FileCategory::Document => format!("{}.gz", detected_extension),
    }
}

/// Per-category wake channels between the dispatcher and idle workers.
///
/// A wake is only a hint; workers also poll, so a dropped wake costs at most
/// one poll interval.
#[derive(Clone)]
pub struct Wakeups {
    channels: HashMap<FileCategory, (Sender<()>, Receiver<()>)>,
}

impl Wakeups {
    pub fn new() -> Self {
        let channels = FileCategory::ALL
            .into_iter()
            .map(|category| (category, bounded(WAKE_CAPACITY)))
            .collect();
        Self { channels }
    }

    pub fn notify(&self, category: FileCategory) {
        if let Some((tx, _)) = self.channels.get(&category) {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    tracing::debug!(%category, "No workers listening for wakeups");
                }
            }
        }
    }

    pub fn receiver(&self, category: FileCategory) -> Option<Receiver<()>> {
        self.channels.get(&category).map(|(_, rx)| rx.clone())
    }
}

impl Default for Wakeups {
    fn default() -> Self {
        Self::new()
    }
}

/// What the caller gets back for one dispatched file.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedFile {
    pub document_id: i64,
    pub encrypted_id: String,
    pub job_id: String,
    pub category: FileCategory,
    pub display_name: String,
    pub temp_path: PathBuf,
    pub destination_path: PathBuf,
}

pub struct Dispatcher {
    db: Database,
    queue: JobQueue,
    allocator: StorageAllocator,
    temp_dir: PathBuf,
    wakeups: Wakeups,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        queue: JobQueue,
        allocator: StorageAllocator,
        temp_dir: impl Into<PathBuf>,
        wakeups: Wakeups,
    ) -> Self {
        Self {
            db,
            queue,
            allocator,
            temp_dir: temp_dir.into(),
            wakeups,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn wakeups(&self) -> &Wakeups {
        &self.wakeups
    }

    /// Stores `file` for processing and queues its job.
    pub fn dispatch(&self, file: &ValidatedFile) -> Result<DispatchedFile, VaultError> {
        let _span = tracing::info_span!("dispatch", category = %file.category).entered();

        let allocation = self.allocator.allocate()?;
        let stem = sanitize_file_stem(&file.original_name);
        let millis = now_millis();

        let temp_path = write_exclusive(
            &self.temp_dir,
            &format!("temp-{}-{}", millis, stem),
            file.extension(),
            &file.bytes,
        )?;

        let encrypted_id = match generate_public_id() {
            Ok(id) => id,
            Err(e) => {
                remove_artifact(&temp_path);
                return Err(e.into());
            }
        };
        let extension = final_extension(file.category, file.extension());

        let registered = self.db.with_tx(|tx| -> Result<_, VaultError> {
            let document_id = document_repo::insert_in(
                tx,
                &NewDocument {
                    category: file.category,
                    display_name: file.original_name.clone(),
                    encrypted_id: encrypted_id.clone(),
                    size_mb: file.size_mb,
                    file_extension: file.extension().to_string(),
                    mime_type: file.mime_type().to_string(),
                },
            )?;

            // The row id keeps names unique within a leaf.
            let destination_path = allocation
                .leaf
                .join(format!("{}-{}.{}", document_id, stem, extension));
            let payload = JobPayload {
                input_path: temp_path.clone(),
                destination_path: destination_path.clone(),
                thumb_dir: allocation.thumb_dir.clone(),
                display_name: file.original_name.clone(),
            };
            let job_id = self
                .queue
                .enqueue_in(tx, file.category, document_id, &payload)?;

            Ok((document_id, job_id, destination_path))
        });

        let (document_id, job_id, destination_path) = match registered {
            Ok(values) => values,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register upload, removing temp copy");
                remove_artifact(&temp_path);
                return Err(e);
            }
        };

        tracing::info!(
            document_id,
            job_id = %job_id,
            size_mb = file.size_mb,
            leaf = %hash_path(&allocation.leaf),
            "Upload dispatched"
        );
        self.wakeups.notify(file.category);

        Ok(DispatchedFile {
            document_id,
            encrypted_id,
            job_id,
            category: file.category,
            display_name: file.original_name.clone(),
            temp_path,
            destination_path,
        })
    }
}
