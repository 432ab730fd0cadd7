use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StorageError;

/// Attempts made by [`safe_delete`] before giving up.
pub const DELETE_ATTEMPTS: u32 = 3;

const DELETE_RETRY_DELAY: Duration = Duration::from_secs(1);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Writes `content` to `<dir>/<stem>.<ext>` without ever overwriting.
///
/// Uses exclusive creation (`O_CREAT | O_EXCL`); when the name is taken the
/// next numbered variant (`<stem>_2.<ext>`, ...) is tried.
pub fn write_exclusive(
    dir: &Path,
    stem: &str,
    extension: &str,
    content: &[u8],
) -> Result<PathBuf, StorageError> {
    use std::io::Write;

    ensure_directory(dir)?;

    for counter in 1..=1000 {
        let filename = if counter == 1 {
            format!("{}.{}", stem, extension)
        } else {
            format!("{}_{}.{}", stem, counter, extension)
        };
        let path = dir.join(filename);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(content).and_then(|_| file.sync_all()) {
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    return Err(StorageError::WriteFile { path, source: e });
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(StorageError::WriteFile { path, source: e }),
        }
    }

    Err(StorageError::WriteFile {
        path: dir.join(format!("{}.{}", stem, extension)),
        source: std::io::Error::new(ErrorKind::AlreadyExists, "no free file name"),
    })
}

/// Number of direct entries in `dir`, or `None` when it does not exist yet.
pub fn count_entries(dir: &Path) -> Result<Option<usize>, StorageError> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(Some(entries.count())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::ReadDirectory {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Deletes a file, retrying transient failures. Never fails: a missing file
/// counts as deleted and exhausted retries are only logged.
pub fn safe_delete(path: &Path) -> bool {
    safe_delete_with(path, DELETE_ATTEMPTS, DELETE_RETRY_DELAY)
}

/// [`safe_delete`] with an explicit attempt count and base delay. The wait
/// before attempt `n + 1` is `n * base_delay`.
pub fn safe_delete_with(path: &Path, attempts: u32, base_delay: Duration) -> bool {
    for attempt in 1..=attempts.max(1) {
        match std::fs::remove_file(path) {
            Ok(()) => {
                log::debug!("Deleted {}", path.display());
                return true;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(e) => {
                log::warn!(
                    "Failed to delete {} (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    std::thread::sleep(base_delay * attempt);
                }
            }
        }
    }

    log::error!(
        "Giving up deleting {} after {} attempts",
        path.display(),
        attempts
    );
    false
}

/// Best-effort removal of a produced artifact. Failures are logged.
pub fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed artifact {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove artifact {}: {}", path.display(), e),
    }
}

/// Megabytes rounded to two decimals.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

pub fn file_size(path: &Path) -> Result<u64, StorageError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| StorageError::Metadata {
            path: path.to_path_buf(),
            source: e,
        })
}
