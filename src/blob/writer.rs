use super::{BlobFileMeta, BlobIndex};
use crate::{file::blob_file_path, id::FileNumberAllocator};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Writes large values into blob files
///
/// The first `add` lazily creates a file; once a file grows past the
/// target size, the next value starts a new one. `finish` makes all
/// written files durable, `abandon` removes them again.
#[allow(clippy::module_name_repetitions)]
pub struct BlobFileWriter {
    folder: PathBuf,
    file_numbers: FileNumberAllocator,
    target_size: u64,

    active: Option<ActiveFile>,
    finished: Vec<BlobFileMeta>,
}

struct ActiveFile {
    file_number: u64,
    writer: BufWriter<File>,
    offset: u64,
    blob_count: u64,
    value_bytes: u64,
}

impl BlobFileWriter {
    pub fn new<P: Into<PathBuf>>(
        folder: P,
        file_numbers: FileNumberAllocator,
        target_size: u64,
    ) -> Self {
        Self {
            folder: folder.into(),
            file_numbers,
            target_size,
            active: None,
            finished: Vec::new(),
        }
    }

    /// Returns `true` if at least one blob was written
    #[must_use]
    pub fn has_output(&self) -> bool {
        self.active.is_some() || !self.finished.is_empty()
    }

    fn roll(&mut self) -> crate::Result<&mut ActiveFile> {
        if let Some(active) = &self.active {
            if active.offset < self.target_size {
                // NOTE: Double lookup to appease the borrow checker
                #[allow(clippy::expect_used)]
                return Ok(self.active.as_mut().expect("file was just checked"));
            }

            self.seal()?;
        }

        let file_number = self.file_numbers.next();
        let path = blob_file_path(&self.folder, file_number);

        std::fs::create_dir_all(&self.folder)?;
        let file = File::create(path)?;

        log::debug!("Starting blob file {file_number}");

        self.active = Some(ActiveFile {
            file_number,
            writer: BufWriter::with_capacity(512_000, file),
            offset: 0,
            blob_count: 0,
            value_bytes: 0,
        });

        // NOTE: Just created above
        #[allow(clippy::expect_used)]
        Ok(self.active.as_mut().expect("file was just created"))
    }

    fn seal(&mut self) -> crate::Result<()> {
        if let Some(mut active) = self.active.take() {
            active.writer.flush()?;
            active.writer.get_mut().sync_all()?;

            self.finished.push(BlobFileMeta {
                file_number: active.file_number,
                blob_count: active.blob_count,
                total_bytes: active.value_bytes,
                garbage_bytes: 0,
                garbage_count: 0,
            });
        }

        Ok(())
    }

    /// Appends one value, returning the pointer to store in the tree
    ///
    /// # Disk representation
    ///
    /// \[key length; 2 bytes] \[key; N bytes] \[value length; 4 bytes] \[value; N bytes]
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> crate::Result<BlobIndex> {
        let active = self.roll()?;

        let offset = active.offset;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        active.writer.write_u16::<BigEndian>(key.len() as u16)?;
        active.writer.write_all(key)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        active.writer.write_u32::<BigEndian>(value.len() as u32)?;
        active.writer.write_all(value)?;

        active.offset += 2 + key.len() as u64 + 4 + value.len() as u64;
        active.blob_count += 1;
        active.value_bytes += value.len() as u64;

        // NOTE: Truncation is okay, blob values are bounded by u32
        #[allow(clippy::cast_possible_truncation)]
        Ok(BlobIndex {
            blob_file: active.file_number,
            offset,
            len: value.len() as u32,
        })
    }

    /// Makes all written blob files durable and returns their metadata
    pub fn finish(mut self) -> crate::Result<Vec<BlobFileMeta>> {
        self.seal()?;
        Ok(std::mem::take(&mut self.finished))
    }

    /// Removes all written blob files after a failed subcompaction
    pub fn abandon(mut self) {
        if let Some(active) = self.active.take() {
            drop(active.writer);

            let path = blob_file_path(&self.folder, active.file_number);
            if let Err(e) = std::fs::remove_file(&path) {
                log::error!("Failed to remove abandoned blob file {}: {e:?}", path.display());
            }
        }

        for meta in self.finished.drain(..) {
            let path = blob_file_path(&self.folder, meta.file_number);
            if let Err(e) = std::fs::remove_file(&path) {
                log::error!("Failed to remove abandoned blob file {}: {e:?}", path.display());
            }
        }
    }
}
