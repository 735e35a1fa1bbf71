use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fs::inode::DataId;
use crate::fs::permissions::OpenMode;

pub const DATA_DIR_NAME: &str = "data";
const BLOB_EXTENSION: &str = "data";

/// Flat blob files under `<root>/data`, one per data id.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(DATA_DIR_NAME),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, data_id: DataId) -> PathBuf {
        self.dir.join(blob_file_name(data_id))
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn create_empty(&self, data_id: DataId) -> io::Result<()> {
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.path(data_id))?;
        Ok(())
    }

    pub fn exists(&self, data_id: DataId) -> bool {
        self.path(data_id).is_file()
    }

    pub fn open(&self, data_id: DataId, mode: OpenMode) -> io::Result<File> {
        OpenOptions::new()
            .read(mode.readable())
            .write(mode.writable())
            .open(self.path(data_id))
    }

    pub fn set_len(&self, data_id: DataId, size: u64) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.path(data_id))?
            .set_len(size)
    }

    pub fn copy(&self, from: DataId, to: DataId) -> io::Result<u64> {
        debug!("Copying blob {} -> {}", from, to);
        fs::copy(self.path(from), self.path(to))
    }

    pub fn remove(&self, data_id: DataId) -> io::Result<()> {
        match fs::remove_file(self.path(data_id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

pub fn blob_file_name(data_id: DataId) -> String {
    format!("{data_id}.{BLOB_EXTENSION}")
}

/// Inverse of [`blob_file_name`]; `None` for anything that is not a blob.
pub fn parse_blob_file_name(name: &str) -> Option<DataId> {
    let stem = name.strip_suffix(BLOB_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
