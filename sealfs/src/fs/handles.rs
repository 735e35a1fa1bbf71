use bytes::Bytes;
use dashmap::DashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::errors::FsError;
use super::inode::{DataId, InodeId};
use super::permissions::OpenMode;

/// Handle value handed out by `opendir`; directories keep no state.
pub const DIR_HANDLE: u64 = 0;

/// An open blob, valid from `open`/`create` until `release`.
#[derive(Debug)]
pub struct FileHandle {
    pub ino: InodeId,
    pub data_id: DataId,
    pub mode: OpenMode,
    file: File,
}

impl FileHandle {
    pub fn new(ino: InodeId, data_id: DataId, mode: OpenMode, file: File) -> Self {
        Self {
            ino,
            data_id,
            mode,
            file,
        }
    }

    /// Reads up to `size` bytes at `offset`; short only at end of file.
    pub fn read_at(&self, offset: u64, size: u32) -> Result<Bytes, FsError> {
        if !self.mode.readable() {
            return Err(FsError::BadHandle);
        }
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        if !self.mode.writable() {
            return Err(FsError::BadHandle);
        }
        self.file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    pub fn sync(&self, datasync: bool) -> Result<(), FsError> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

pub struct HandleTable {
    handles: DashMap<u64, Arc<FileHandle>>,
    next_fh: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(DIR_HANDLE + 1),
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<FileHandle>, FsError> {
        self.handles
            .get(&fh)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(FsError::BadHandle)
    }

    pub fn remove(&self, fh: u64) -> Result<Arc<FileHandle>, FsError> {
        self.handles
            .remove(&fh)
            .map(|(_, handle)| handle)
            .ok_or(FsError::BadHandle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}
