use crate::{file::segment_file_path, sharded::Sharded};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

const SHARD_COUNT: usize = 4;

/// Keeps read file descriptors of table files open, keyed by file number
///
/// Each file gets a couple of descriptors behind independent mutexes,
/// so concurrent subcompactions and verification readers do not
/// serialize on a single descriptor.
#[allow(clippy::module_name_repetitions)]
pub struct DescriptorTable {
    folder: PathBuf,
    files: RwLock<HashMap<u64, Arc<Sharded<File>>>>,
}

impl DescriptorTable {
    /// Creates a new descriptor table for table files inside `folder`
    pub fn new<P: AsRef<Path>>(folder: P) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            files: RwLock::new(HashMap::with_capacity(100)),
        }
    }

    /// Gives access to the descriptors of one table file, opening them on first use
    pub fn access(&self, file_number: u64) -> crate::Result<Arc<Sharded<File>>> {
        {
            let files = self.files.read().expect("lock is poisoned");

            if let Some(shards) = files.get(&file_number) {
                return Ok(shards.clone());
            }
        }

        let path = segment_file_path(&self.folder, file_number);

        let shards = (0..SHARD_COUNT)
            .map(|_| {
                let file = File::open(&path)?;
                Ok(std::sync::Mutex::new(file))
            })
            .collect::<crate::Result<Vec<_>>>()?;

        let shards = Arc::new(Sharded::new(shards));

        let mut files = self.files.write().expect("lock is poisoned");

        // NOTE: Races are benign here, the loser just drops its descriptors
        let shards = files.entry(file_number).or_insert(shards);

        Ok(shards.clone())
    }

    /// Drops the descriptors of a file, e.g. before it is deleted
    pub fn evict(&self, file_number: u64) {
        let mut files = self.files.write().expect("lock is poisoned");
        files.remove(&file_number);
    }
}
