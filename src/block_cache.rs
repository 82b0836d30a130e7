use crate::segment::block::ValueBlock;
use quick_cache::{sync::Cache, Weighter};
use std::sync::Arc;

// (File number, block offset)
type CacheKey = (u64, u64);

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Arc<ValueBlock>> for BlockWeighter {
    fn weight(&self, _: &CacheKey, block: &Arc<ValueBlock>) -> u32 {
        // NOTE: Truncation is fine: blocks are ~64K max
        #[allow(clippy::cast_possible_truncation)]
        {
            block.size() as u32
        }
    }
}

/// Block cache, in which data blocks are cached in-memory
/// after being retrieved from disk
///
/// Compaction inserts the blocks it reads back during verification,
/// so subsequent user reads of freshly compacted data are warm.
pub struct BlockCache {
    data: Cache<CacheKey, Arc<ValueBlock>, BlockWeighter>,
    capacity: u64,
}

impl BlockCache {
    /// Creates a new block cache with the given capacity in bytes
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        Self {
            data: Cache::with_weighter(10_000, bytes, BlockWeighter),
            capacity: bytes,
        }
    }

    /// Returns the cache capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of cached blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if there are no cached blocks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[doc(hidden)]
    pub fn insert_data_block(&self, file_number: u64, offset: u64, value: Arc<ValueBlock>) {
        if self.capacity > 0 {
            self.data.insert((file_number, offset), value);
        }
    }

    #[doc(hidden)]
    #[must_use]
    pub fn get_data_block(&self, file_number: u64, offset: u64) -> Option<Arc<ValueBlock>> {
        self.data.get(&(file_number, offset))
    }
}
