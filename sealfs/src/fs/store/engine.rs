use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::blob::BlobStore;
use super::table::{InodeTable, Removed};
use crate::fs::errors::FsError;
use crate::fs::inode::{DataId, Inode, InodeId, InodeKind};
use crate::fs::types::{FsStats, Timestamp};

/// Inode/directory engine: the table behind one lock, plus the blob side
/// effects of structural changes. Every accessor hands out owned copies.
pub struct Engine {
    table: RwLock<InodeTable>,
    blobs: BlobStore,
}

impl Engine {
    pub fn new(table: InodeTable, blobs: BlobStore) -> Self {
        Self {
            table: RwLock::new(table),
            blobs,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, InodeTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InodeTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Runs `f` against the table under the shared lock.
    pub fn with_table<T>(&self, f: impl FnOnce(&InodeTable) -> T) -> T {
        f(&self.read())
    }

    pub fn lookup(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        self.read().lookup(parent, name)
    }

    pub fn lookup_entry(&self, id: InodeId) -> Option<Inode> {
        self.read().get(id).cloned()
    }

    pub fn lookup_child_entry(&self, parent: InodeId, name: &str) -> Option<Inode> {
        self.read().get_child(parent, name).cloned()
    }

    pub fn get_children(&self, dir_id: InodeId) -> Option<HashMap<String, InodeId>> {
        self.read().children(dir_id).cloned()
    }

    pub fn get_parent(&self, id: InodeId) -> InodeId {
        self.read().parent(id)
    }

    pub fn stats(&self) -> FsStats {
        self.read().stats()
    }

    /// Creates an entry; files get an empty blob on disk before this returns.
    pub fn create(
        &self,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        mode: u32,
        owner: (u32, u32),
    ) -> Result<Inode, FsError> {
        let mut table = self.write();
        let inode = table.create(parent, name, kind, mode, owner)?;

        if let Some(data_id) = inode.data_id()
            && let Err(e) = self.blobs.create_empty(data_id)
        {
            warn!("Failed to create blob {} for inode {}: {}", data_id, inode.id, e);
            if let Err(undo) = table.remove(inode.id, kind) {
                warn!("Failed to roll back inode {}: {}", inode.id, undo);
            }
            return Err(e.into());
        }
        Ok(inode)
    }

    pub fn cow_alias(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        source: InodeId,
        owner: (u32, u32),
    ) -> Result<Inode, FsError> {
        self.write().cow_alias(parent, name, mode, source, owner)
    }

    pub fn remove(&self, id: InodeId, expected: InodeKind) -> Result<Inode, FsError> {
        let removed = self.write().remove(id, expected)?;
        Ok(self.finish_removal(removed))
    }

    /// `remove` addressed by name, resolved under the same lock.
    pub fn remove_child(
        &self,
        parent: InodeId,
        name: &str,
        expected: InodeKind,
    ) -> Result<Inode, FsError> {
        let removed = {
            let mut table = self.write();
            if table.children(parent).is_none() {
                return Err(match table.get(parent) {
                    Some(_) => FsError::NotDirectory,
                    None => FsError::NotFound,
                });
            }
            let id = table.lookup(parent, name).ok_or(FsError::NotFound)?;
            table.remove(id, expected)?
        };
        Ok(self.finish_removal(removed))
    }

    pub fn rename(
        &self,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<(), FsError> {
        let replaced = self.write().rename(parent, name, new_parent, new_name)?;
        if let Some(removed) = replaced {
            self.finish_removal(removed);
        }
        Ok(())
    }

    fn finish_removal(&self, removed: Removed) -> Inode {
        if let Some(data_id) = removed.released_blob {
            debug!("Deleting blob {} of inode {}", data_id, removed.inode.id);
            if let Err(e) = self.blobs.remove(data_id) {
                warn!("Failed to delete blob {}: {}", data_id, e);
            }
        }
        removed.inode
    }

    /// Gives `id` a blob no other entry shares, copying the bytes if needed.
    pub fn ensure_private_blob(&self, id: InodeId) -> Result<DataId, FsError> {
        let mut table = self.write();
        let data_id = table
            .get(id)
            .ok_or(FsError::NotFound)?
            .data_id()
            .ok_or(FsError::IsDirectory)?;
        if table.data_refs(data_id) <= 1 {
            return Ok(data_id);
        }

        let private = table.allocate_data_id()?;
        self.blobs.copy(data_id, private)?;
        table.rebind_data(id, private)?;
        debug!(
            "Inode {} diverged from shared blob {} into {}",
            id, data_id, private
        );
        Ok(private)
    }

    /// Records `written` bytes landing at `offset`.
    pub fn record_write(&self, id: InodeId, offset: u64, written: u64) -> Result<Inode, FsError> {
        self.update(id, |inode| {
            let now = Timestamp::now();
            inode.attrs.size = inode.attrs.size.max(offset + written);
            inode.attrs.mtime = now;
            inode.attrs.ctime = now;
            Ok(())
        })
    }

    /// Truncates or extends the blob and records the new size.
    pub fn set_size(&self, id: InodeId, size: u64) -> Result<Inode, FsError> {
        let data_id = self.ensure_private_blob(id)?;
        let mut table = self.write();
        self.blobs.set_len(data_id, size)?;
        let inode = table.get_mut(id).ok_or(FsError::NotFound)?;
        let now = Timestamp::now();
        inode.attrs.size = size;
        inode.attrs.mtime = now;
        inode.attrs.ctime = now;
        Ok(inode.clone())
    }

    /// Applies `f` to the entry under the exclusive lock.
    pub fn update(
        &self,
        id: InodeId,
        f: impl FnOnce(&mut Inode) -> Result<(), FsError>,
    ) -> Result<Inode, FsError> {
        let mut table = self.write();
        let inode = table.get_mut(id).ok_or(FsError::NotFound)?;
        f(inode)?;
        Ok(inode.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::ROOT_INODE_ID;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine() -> (TempDir, Engine) {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(dir.path());
        blobs.ensure_dir().unwrap();
        let engine = Engine::new(InodeTable::bootstrap(0, 0), blobs);
        (dir, engine)
    }

    #[test]
    fn test_create_materializes_blob_and_remove_deletes_it() {
        let (_dir, engine) = engine();
        let file = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap();
        let data_id = file.data_id().unwrap();
        assert!(engine.blobs().exists(data_id));

        engine.remove(file.id, InodeKind::File).unwrap();
        assert!(!engine.blobs().exists(data_id));
        assert!(engine.lookup_entry(file.id).is_none());
    }

    #[test]
    fn test_failed_blob_creation_rolls_back_entry() {
        let (_dir, engine) = engine();
        std::fs::remove_dir(engine.blobs().dir()).unwrap();

        let err = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap_err();
        assert_eq!(err, FsError::Io(libc::ENOENT));
        assert_eq!(engine.lookup(ROOT_INODE_ID, "f"), None);
        assert!(engine.get_children(ROOT_INODE_ID).unwrap().is_empty());
        assert_eq!(engine.stats().files, 0);

        engine.blobs().ensure_dir().unwrap();
        let file = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap();
        assert!(engine.blobs().exists(file.data_id().unwrap()));
    }

    #[test]
    fn test_alias_blob_survives_until_last_reference() {
        let (_dir, engine) = engine();
        let file = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap();
        let alias = engine
            .cow_alias(ROOT_INODE_ID, "g", 0o644, file.id, (0, 0))
            .unwrap();
        let data_id = file.data_id().unwrap();

        engine.remove_child(ROOT_INODE_ID, "f", InodeKind::File).unwrap();
        assert!(engine.blobs().exists(data_id));
        engine.remove(alias.id, InodeKind::File).unwrap();
        assert!(!engine.blobs().exists(data_id));
    }

    #[test]
    fn test_private_blob_copies_shared_bytes() {
        let (_dir, engine) = engine();
        let file = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap();
        let shared = file.data_id().unwrap();
        std::fs::write(engine.blobs().path(shared), b"original").unwrap();
        let alias = engine
            .cow_alias(ROOT_INODE_ID, "g", 0o644, file.id, (0, 0))
            .unwrap();

        let private = engine.ensure_private_blob(alias.id).unwrap();
        assert_ne!(private, shared);
        assert_eq!(std::fs::read(engine.blobs().path(private)).unwrap(), b"original");
        assert_eq!(engine.ensure_private_blob(file.id).unwrap(), shared);
        assert_eq!(engine.with_table(|t| t.data_refs(shared)), 1);
    }

    #[test]
    fn test_record_write_grows_to_furthest_byte() {
        let (_dir, engine) = engine();
        let file = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap();

        assert_eq!(engine.record_write(file.id, 0, 10).unwrap().attrs.size, 10);
        assert_eq!(engine.record_write(file.id, 2, 3).unwrap().attrs.size, 10);
        assert_eq!(engine.record_write(file.id, 8, 4).unwrap().attrs.size, 12);
    }

    #[test]
    fn test_remove_child_errors() {
        let (_dir, engine) = engine();
        let file = engine
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, (0, 0))
            .unwrap();
        assert_eq!(
            engine
                .remove_child(ROOT_INODE_ID, "missing", InodeKind::File)
                .unwrap_err(),
            FsError::NotFound
        );
        assert_eq!(
            engine.remove_child(file.id, "x", InodeKind::File).unwrap_err(),
            FsError::NotDirectory
        );
        assert_eq!(
            engine
                .remove_child(ROOT_INODE_ID, "f", InodeKind::Dir)
                .unwrap_err(),
            FsError::NotDirectory
        );
    }

    #[test]
    fn test_concurrent_creates_get_distinct_ids() {
        let (_dir, engine) = engine();
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| {
                            engine
                                .create(
                                    ROOT_INODE_ID,
                                    &format!("t{t}-{i}"),
                                    InodeKind::File,
                                    0o644,
                                    (0, 0),
                                )
                                .unwrap()
                                .id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(engine.get_children(ROOT_INODE_ID).unwrap().len(), 200);
    }
}
