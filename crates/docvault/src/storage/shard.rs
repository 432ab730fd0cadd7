//! The shard tree record: one directory-name hash per level, shared by every
//! allocator through the database and cached in-process with a TTL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use moka::sync::Cache;

use crate::db::shard_repo::{self, ShardTreeRow, SHARD_DEPTH};
use crate::db::Database;
use crate::error::StorageError;

/// Length of a generated directory-name hash.
pub const HASH_LEN: usize = 6;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of the alphabet size that fits in a byte; bytes at or
/// above it are redrawn so every character is equally likely.
const UNBIASED_LIMIT: u8 = (256 / ALPHABET.len() * ALPHABET.len()) as u8;

/// Generates a random alphanumeric directory name.
pub fn random_hash() -> Result<String, StorageError> {
    let mut out = String::with_capacity(HASH_LEN);
    let mut buf = [0u8; 16];

    while out.len() < HASH_LEN {
        getrandom::getrandom(&mut buf).map_err(|e| StorageError::Random(e.to_string()))?;
        for &b in buf.iter().filter(|&&b| b < UNBIASED_LIMIT) {
            if out.len() == HASH_LEN {
                break;
            }
            out.push(ALPHABET[b as usize % ALPHABET.len()] as char);
        }
    }

    Ok(out)
}

/// Snapshot of the shard tree record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTree {
    pub levels: [String; SHARD_DEPTH],
    pub version: i64,
}

impl ShardTree {
    /// Directory formed by the first `depth` level hashes under `root`.
    pub fn path_to(&self, root: &Path, depth: usize) -> PathBuf {
        self.levels
            .iter()
            .take(depth)
            .fold(root.to_path_buf(), |path, hash| path.join(hash))
    }

    pub fn leaf(&self, root: &Path) -> PathBuf {
        self.path_to(root, SHARD_DEPTH)
    }
}

impl From<ShardTreeRow> for ShardTree {
    fn from(row: ShardTreeRow) -> Self {
        Self {
            levels: row.levels,
            version: row.version,
        }
    }
}

/// Store handle for the shard tree record.
///
/// Reads go through a TTL cache; a lost conditional write invalidates the
/// cache so the next read sees the winner's record.
#[derive(Clone)]
pub struct ShardTreeStore {
    db: Database,
    cache: Cache<(), ShardTree>,
}

impl ShardTreeStore {
    pub fn new(db: Database, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1).time_to_live(ttl).build();
        Self { db, cache }
    }

    /// Returns the current record, creating it on first use.
    pub fn current(&self) -> Result<ShardTree, StorageError> {
        if let Some(tree) = self.cache.get(&()) {
            return Ok(tree);
        }

        let tree = match shard_repo::load(&self.db)? {
            Some(row) => ShardTree::from(row),
            None => self.create()?,
        };

        self.cache.insert((), tree.clone());
        Ok(tree)
    }

    fn create(&self) -> Result<ShardTree, StorageError> {
        let mut levels: [String; SHARD_DEPTH] = Default::default();
        for level in levels.iter_mut() {
            *level = random_hash()?;
        }

        if shard_repo::insert_initial(&self.db, &levels)? {
            tracing::info!(leaf = %levels.join("/"), "Created shard tree record");
        }

        // Another process may have inserted first; its record wins.
        shard_repo::load(&self.db)?
            .map(ShardTree::from)
            .ok_or_else(|| StorageError::Contended(1))
    }

    /// Writes `hash` into `level` (0-based) if `tree` is still current.
    ///
    /// Returns the updated tree, or `None` when another writer got there first.
    pub fn replace_level(
        &self,
        tree: &ShardTree,
        level: usize,
        hash: String,
    ) -> Result<Option<ShardTree>, StorageError> {
        if !shard_repo::replace_level(&self.db, level, &hash, tree.version)? {
            self.invalidate();
            return Ok(None);
        }

        let mut next = tree.clone();
        next.levels[level] = hash;
        next.version += 1;
        self.cache.insert((), next.clone());
        Ok(Some(next))
    }

    pub fn invalidate(&self) {
        self.cache.invalidate(&());
    }
}
