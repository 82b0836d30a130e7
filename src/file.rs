use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

pub const SEGMENTS_FOLDER: &str = "segments";
pub const BLOBS_FOLDER: &str = "blobs";
pub const LEVELS_MANIFEST_FILE: &str = "levels.json";

pub const SEGMENT_FILE_EXT: &str = "sst";
pub const BLOB_FILE_EXT: &str = "blob";

/// Builds the path of a segment file from its file number
pub fn segment_file_path<P: AsRef<Path>>(folder: P, file_number: u64) -> PathBuf {
    folder
        .as_ref()
        .join(format!("{file_number}.{SEGMENT_FILE_EXT}"))
}

/// Builds the path of a blob file from its file number
pub fn blob_file_path<P: AsRef<Path>>(folder: P, file_number: u64) -> PathBuf {
    folder
        .as_ref()
        .join(format!("{file_number}.{BLOB_FILE_EXT}"))
}

/// Atomically rewrites a file
pub fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let folder = path.parent().expect("should have parent folder");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
    }

    Ok(())
}

/// Fsyncs a directory, making changes to its entry list durable
///
/// No-op on Windows, where directories cannot be opened for syncing.
pub fn fsync_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    #[cfg(not(target_os = "windows"))]
    {
        let folder = File::open(path)?;
        folder.sync_all()?;
    }

    #[cfg(target_os = "windows")]
    let _ = path;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use test_log::test;

    #[test]
    fn test_atomic_rewrite() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = dir.path().join("test.txt");
        {
            let mut file = File::create(&path)?;
            write!(file, "asdasdasdasdasd")?;
        }

        rewrite_atomic(&path, b"newcontent")?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!("newcontent", content);

        Ok(())
    }
}
