use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{Acquire, Release},
    },
    Arc,
};

/// Thread-safe file number generator
///
/// Every table and blob file gets its identity from this counter;
/// numbers are never reused within one manifest lineage.
///
/// # Examples
///
/// ```
/// # use lsm_compaction::FileNumberAllocator;
/// #
/// let numbers = FileNumberAllocator::new(10);
///
/// assert_eq!(10, numbers.next());
/// assert_eq!(11, numbers.next());
/// ```
#[derive(Clone, Default, Debug)]
pub struct FileNumberAllocator(Arc<AtomicU64>);

impl std::ops::Deref for FileNumberAllocator {
    type Target = Arc<AtomicU64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FileNumberAllocator {
    /// Creates a new allocator, starting at some previous value
    #[must_use]
    pub fn new(next: u64) -> Self {
        Self(Arc::new(AtomicU64::new(next)))
    }

    /// Returns the next file number that would be handed out.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.load(Acquire)
    }

    /// Allocates the next file number.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.fetch_add(1, Release)
    }
}
