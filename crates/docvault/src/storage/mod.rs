pub mod allocator;
pub mod filesystem;
pub mod shard;

pub use allocator::{Allocation, StorageAllocator, THUMB_DIR};
pub use shard::{ShardTree, ShardTreeStore};
