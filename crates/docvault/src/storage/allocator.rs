//! Chooses the leaf directory for each accepted upload.
//!
//! Levels are checked deepest first. A full directory gets a fresh hash for
//! its level and the walk continues one level up with the new hash in place;
//! the first level with room ends the walk. A burst of uploads can overshoot
//! the ceiling slightly when allocators race, which is accepted.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::db::shard_repo::SHARD_DEPTH;
use crate::db::Database;
use crate::error::StorageError;
use crate::storage::filesystem::{count_entries, ensure_directory};
use crate::storage::shard::{random_hash, ShardTree, ShardTreeStore};

/// Rounds of re-reading the record after losing a conditional write.
const MAX_CONTENTION_RETRIES: u32 = 5;

/// Draws per level before giving up on finding an unused directory name.
const MAX_HASH_DRAWS: usize = 16;

/// Name of the thumbnail directory inside each leaf.
pub const THUMB_DIR: &str = "thumb";

/// Where one upload's artifacts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub leaf: PathBuf,
    pub thumb_dir: PathBuf,
}

pub struct StorageAllocator {
    root: PathBuf,
    store: ShardTreeStore,
    max_items_per_layer: usize,
    /// Held only for the read-modify-write of the record, never during I/O
    /// on uploaded content.
    lock: Mutex<()>,
}

impl StorageAllocator {
    pub fn new(
        root: impl Into<PathBuf>,
        db: Database,
        max_items_per_layer: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self::with_store(root, ShardTreeStore::new(db, cache_ttl), max_items_per_layer)
    }

    pub fn with_store(
        root: impl Into<PathBuf>,
        store: ShardTreeStore,
        max_items_per_layer: usize,
    ) -> Self {
        Self {
            root: root.into(),
            store,
            max_items_per_layer: max_items_per_layer.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the active leaf, re-hashing full levels, and makes sure it
    /// exists on disk.
    pub fn allocate(&self) -> Result<Allocation, StorageError> {
        let _span = tracing::debug_span!("storage.allocate").entered();
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        for _ in 0..MAX_CONTENTION_RETRIES {
            let tree = self.store.current()?;
            if let Some(tree) = self.rebalance(tree)? {
                let leaf = tree.leaf(&self.root);
                ensure_directory(&leaf)?;
                return Ok(Allocation {
                    thumb_dir: leaf.join(THUMB_DIR),
                    leaf,
                });
            }
            tracing::debug!("Shard tree changed during allocation, retrying");
        }

        Err(StorageError::Contended(MAX_CONTENTION_RETRIES))
    }

    /// Walks from the deepest level up. Returns `None` when a conditional
    /// write lost against another allocator.
    fn rebalance(&self, mut tree: ShardTree) -> Result<Option<ShardTree>, StorageError> {
        for level in (0..SHARD_DEPTH).rev() {
            let dir = tree.path_to(&self.root, level + 1);
            match count_entries(&dir)? {
                None => break,
                Some(count) if count < self.max_items_per_layer => break,
                Some(count) => {
                    let parent = tree.path_to(&self.root, level);
                    let hash = unused_hash(&parent)?;
                    tracing::info!(
                        level = level + 1,
                        entries = count,
                        ceiling = self.max_items_per_layer,
                        hash = %hash,
                        "Shard level full, rotating to a new directory"
                    );
                    match self.store.replace_level(&tree, level, hash)? {
                        Some(next) => tree = next,
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(Some(tree))
    }
}

fn unused_hash(parent: &Path) -> Result<String, StorageError> {
    for _ in 0..MAX_HASH_DRAWS {
        let hash = random_hash()?;
        if !parent.join(&hash).exists() {
            return Ok(hash);
        }
    }
    Err(StorageError::HashExhausted(parent.to_path_buf()))
}
