use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fs::errors::StoreError;

pub const LOCK_FILE_NAME: &str = ".sealfs.lock";

/// Exclusive advisory lock over a persistence root, held until dropped.
///
/// Not `Clone`: there is exactly one owner. Moving the guard moves the
/// lock; the kernel also drops the lock if the process dies.
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    pub fn acquire(root: &Path) -> Result<Self, StoreError> {
        if !root.is_dir() {
            return Err(StoreError::InvalidRoot(root.to_path_buf()));
        }

        let path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(Errno::WOULDBLOCK) => return Err(StoreError::AlreadyMounted(root.to_path_buf())),
            Err(e) => return Err(StoreError::Io(e.into())),
        }

        debug!("Acquired root lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, FlockOperation::Unlock) {
            warn!("Failed to release root lock {}: {}", self.path.display(), e);
        }
    }
}
