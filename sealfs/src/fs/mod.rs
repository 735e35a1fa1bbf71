pub mod dirbuf;
pub mod errors;
pub mod handles;
pub mod inode;
pub mod permissions;
pub mod store;
pub mod types;

use bytes::Bytes;
use std::path::Path;
use tracing::{debug, info, warn};

use self::dirbuf::DirBuf;
use self::errors::{FsError, StoreError};
use self::handles::{DIR_HANDLE, FileHandle, HandleTable};
use self::inode::{Inode, InodeId, InodeKind};
use self::permissions::{
    AccessMode, Credentials, OpenMode, can_set_times, check_access, check_open, check_ownership,
    validate_mode,
};
use self::store::{Engine, StoreRoot, ValidationReport};
use self::types::{
    FileAttributes, FsStats, S_IFMT, SetAttributes, SetGid, SetMode, SetSize, SetTime, SetUid,
    Timestamp,
};

pub const NAME_MAX: usize = 255;

const DOT_COOKIE: u64 = 1;
const DOTDOT_COOKIE: u64 = 2;

fn child_cookie(id: InodeId) -> u64 {
    id.saturating_add(DOTDOT_COOKIE)
}

pub fn validate_filename(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        Err(FsError::InvalidArgument)
    } else if name.len() > NAME_MAX {
        Err(FsError::NameTooLong)
    } else {
        Ok(())
    }
}

/// The operation handlers, independent of the kernel bridge. Every call
/// takes the caller's credentials and returns `FsError` for the adapter to
/// translate into an errno.
pub struct SealFs {
    store: StoreRoot,
    handles: HandleTable,
}

impl SealFs {
    pub fn new(store: StoreRoot) -> Self {
        Self {
            store,
            handles: HandleTable::new(),
        }
    }

    pub fn open_root(root: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(StoreRoot::open(root)?))
    }

    pub fn store(&self) -> &StoreRoot {
        &self.store
    }

    fn engine(&self) -> &Engine {
        self.store.engine()
    }

    fn entry(&self, id: InodeId) -> Result<Inode, FsError> {
        self.engine().lookup_entry(id).ok_or(FsError::NotFound)
    }

    fn directory(&self, id: InodeId) -> Result<Inode, FsError> {
        let inode = self.entry(id)?;
        if inode.is_directory() {
            Ok(inode)
        } else {
            Err(FsError::NotDirectory)
        }
    }

    /// Write and search permission on `parent`, needed to add or drop names.
    fn check_dir_writable(&self, creds: &Credentials, parent: InodeId) -> Result<Inode, FsError> {
        let dir = self.directory(parent)?;
        check_access(&dir, creds, AccessMode::Write)?;
        check_access(&dir, creds, AccessMode::Execute)?;
        Ok(dir)
    }

    /// Startup validation of the blob directory, repairing missing blobs.
    pub fn init(&self) -> Result<ValidationReport, StoreError> {
        let report = self.store.validate(true)?;
        let stats = self.engine().stats();
        info!(
            "Filesystem ready: {} inodes ({} files, {} directories), {} bytes",
            stats.inodes, stats.files, stats.directories, stats.used_bytes
        );
        if !report.is_clean() {
            warn!(
                "Data directory check: {} stray, {} orphaned, {} recreated",
                report.stray_files.len(),
                report.orphaned_blobs.len(),
                report.missing_blobs.len()
            );
        }
        Ok(report)
    }

    pub fn lookup(
        &self,
        creds: &Credentials,
        parent: InodeId,
        name: &str,
    ) -> Result<FileAttributes, FsError> {
        let dir = self.directory(parent)?;
        check_access(&dir, creds, AccessMode::Execute)?;
        let child = self
            .engine()
            .lookup_child_entry(parent, name)
            .ok_or(FsError::NotFound)?;
        Ok(child.attributes())
    }

    pub fn getattr(&self, id: InodeId) -> Result<FileAttributes, FsError> {
        Ok(self.entry(id)?.attributes())
    }

    pub fn opendir(&self, creds: &Credentials, id: InodeId) -> Result<u64, FsError> {
        let dir = self.directory(id)?;
        check_access(&dir, creds, AccessMode::Read)?;
        Ok(DIR_HANDLE)
    }

    /// Up to `max_size` bytes of the packed listing, starting after the
    /// entry `cookie` names (0 starts from the top). Entries are `.`, `..`,
    /// then children in inode order; a child's cookie derives from its
    /// inode id, so removing or adding entries between calls never shifts
    /// the ones still to come.
    pub fn readdir(&self, id: InodeId, cookie: u64, max_size: usize) -> Result<Bytes, FsError> {
        let buf = self.engine().with_table(|table| {
            let dir = table.get(id).ok_or(FsError::NotFound)?;
            let children = dir.children().ok_or(FsError::NotDirectory)?;

            let mut buf = DirBuf::new();
            buf.add_entry(".", Some(dir), DOT_COOKIE);
            buf.add_entry("..", table.get(dir.parent), DOTDOT_COOKIE);

            let mut entries: Vec<_> = children.iter().collect();
            entries.sort_unstable_by_key(|(_, child)| **child);
            for (name, child) in entries {
                match table.get(*child) {
                    Some(inode) => buf.add_entry(name, Some(inode), child_cookie(*child)),
                    None => warn!("Directory {} lists missing inode {}", id, child),
                }
            }
            Ok::<_, FsError>(buf)
        })?;
        Ok(buf.reply(buf.resume_offset(cookie), max_size))
    }

    /// Opens a file for the access mode in `flags`. A writable open gives
    /// the entry a private blob first, so aliases never see the writes.
    pub fn open(&self, creds: &Credentials, id: InodeId, flags: i32) -> Result<u64, FsError> {
        let mode = OpenMode::from_flags(flags)?;
        let inode = self
            .engine()
            .lookup_entry(id)
            .ok_or(FsError::InvalidArgument)?;
        if inode.is_directory() {
            return Err(FsError::IsDirectory);
        }
        check_open(&inode, creds, mode)?;

        let data_id = if mode.writable() {
            let data_id = self.engine().ensure_private_blob(id)?;
            if flags & libc::O_TRUNC != 0 {
                self.engine().set_size(id, 0)?;
            }
            data_id
        } else {
            inode.data_id().ok_or(FsError::IsDirectory)?
        };

        let file = self.engine().blobs().open(data_id, mode)?;
        let fh = self.handles.insert(FileHandle::new(id, data_id, mode, file));
        debug!("Opened inode {} as handle {} ({:?})", id, fh, mode);
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes, FsError> {
        self.handles.get(fh)?.read_at(offset, size)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let handle = self.handles.get(fh)?;
        let written = handle.write_at(offset, data)?;
        match self
            .engine()
            .record_write(handle.ino, offset, u64::from(written))
        {
            // Unlinked while open: the bytes land in a detached blob.
            Ok(_) | Err(FsError::NotFound) => Ok(written),
            Err(e) => Err(e),
        }
    }

    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        let handle = self.handles.remove(fh)?;
        debug!(
            "Released handle {} of inode {} (blob {})",
            fh, handle.ino, handle.data_id
        );
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<(), FsError> {
        self.handles.get(fh)?.sync(datasync)
    }

    /// Creates a file and opens it in one step. The creator gets the
    /// requested access whatever `mode` says.
    pub fn create(
        &self,
        creds: &Credentials,
        parent: InodeId,
        name: &str,
        mode: u32,
        flags: i32,
    ) -> Result<(FileAttributes, u64), FsError> {
        validate_filename(name)?;
        let open_mode = OpenMode::from_flags(flags)?;
        self.check_dir_writable(creds, parent)?;

        let inode = self.engine().create(
            parent,
            name,
            InodeKind::File,
            mode,
            (creds.uid, creds.gid),
        )?;
        let data_id = inode.data_id().ok_or(FsError::InvalidData)?;

        let file = match self.engine().blobs().open(data_id, open_mode) {
            Ok(file) => file,
            Err(e) => {
                if let Err(undo) = self.engine().remove(inode.id, InodeKind::File) {
                    warn!("Failed to roll back inode {}: {}", inode.id, undo);
                }
                return Err(e.into());
            }
        };
        let fh = self
            .handles
            .insert(FileHandle::new(inode.id, data_id, open_mode, file));
        debug!("Created {:?} as inode {} in {}", name, inode.id, parent);
        Ok((inode.attributes(), fh))
    }

    pub fn mkdir(
        &self,
        creds: &Credentials,
        parent: InodeId,
        name: &str,
        mode: u32,
    ) -> Result<FileAttributes, FsError> {
        validate_filename(name)?;
        self.check_dir_writable(creds, parent)?;
        let inode = self.engine().create(
            parent,
            name,
            InodeKind::Dir,
            mode,
            (creds.uid, creds.gid),
        )?;
        debug!("Created directory {:?} as inode {} in {}", name, inode.id, parent);
        Ok(inode.attributes())
    }

    pub fn unlink(&self, creds: &Credentials, parent: InodeId, name: &str) -> Result<(), FsError> {
        self.check_dir_writable(creds, parent)?;
        let removed = self.engine().remove_child(parent, name, InodeKind::File)?;
        debug!("Unlinked {:?} (inode {}) from {}", name, removed.id, parent);
        Ok(())
    }

    pub fn rmdir(&self, creds: &Credentials, parent: InodeId, name: &str) -> Result<(), FsError> {
        self.check_dir_writable(creds, parent)?;
        let removed = self.engine().remove_child(parent, name, InodeKind::Dir)?;
        debug!("Removed directory {:?} (inode {}) from {}", name, removed.id, parent);
        Ok(())
    }

    pub fn rename(
        &self,
        creds: &Credentials,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<(), FsError> {
        validate_filename(new_name)?;
        self.check_dir_writable(creds, parent)?;
        if new_parent != parent {
            self.check_dir_writable(creds, new_parent)?;
        }
        self.engine().rename(parent, name, new_parent, new_name)?;
        debug!(
            "Renamed {:?} in {} to {:?} in {}",
            name, parent, new_name, new_parent
        );
        Ok(())
    }

    pub fn setattr(
        &self,
        creds: &Credentials,
        id: InodeId,
        setattr: &SetAttributes,
    ) -> Result<FileAttributes, FsError> {
        debug!("setattr: id={}, setattr={:?}", id, setattr);
        let inode = self.entry(id)?;

        if matches!(setattr.mode, SetMode::Set(_)) {
            check_ownership(&inode, creds)?;
        }

        let changing_uid = matches!(setattr.uid, SetUid::Set(_));
        let changing_gid = matches!(setattr.gid, SetGid::Set(_));
        if (changing_uid || changing_gid) && creds.uid != 0 {
            check_ownership(&inode, creds)?;

            if let SetUid::Set(new_uid) = setattr.uid
                && new_uid != inode.uid()
            {
                return Err(FsError::OperationNotPermitted);
            }

            // The owner may only pick one of their own groups.
            if let SetGid::Set(new_gid) = setattr.gid
                && !creds.is_member_of_group(new_gid)
            {
                return Err(FsError::OperationNotPermitted);
            }
        }

        for time in [&setattr.atime, &setattr.mtime] {
            match time {
                SetTime::SetToClientTime(_) => can_set_times(&inode, creds, false)?,
                SetTime::SetToServerTime => can_set_times(&inode, creds, true)?,
                SetTime::NoChange => {}
            }
        }

        if let SetSize::Set(size) = setattr.size {
            if inode.is_directory() {
                return Err(FsError::IsDirectory);
            }
            check_access(&inode, creds, AccessMode::Write)?;
            if size != inode.attrs.size {
                self.engine().set_size(id, size)?;
            }
        }

        let updated = self.engine().update(id, |inode| {
            let now = Timestamp::now();
            if let SetMode::Set(mode) = setattr.mode {
                inode.attrs.mode = (inode.attrs.mode & S_IFMT) | validate_mode(mode);
            }
            if let SetUid::Set(uid) = setattr.uid {
                inode.attrs.uid = uid;
            }
            if let SetGid::Set(gid) = setattr.gid {
                inode.attrs.gid = gid;
            }
            match setattr.atime {
                SetTime::SetToClientTime(t) => inode.attrs.atime = t,
                SetTime::SetToServerTime => inode.attrs.atime = now,
                SetTime::NoChange => {}
            }
            match setattr.mtime {
                SetTime::SetToClientTime(t) => inode.attrs.mtime = t,
                SetTime::SetToServerTime => inode.attrs.mtime = now,
                SetTime::NoChange => {}
            }
            inode.attrs.ctime = now;
            Ok(())
        })?;
        Ok(updated.attributes())
    }

    pub fn statfs(&self) -> FsStats {
        self.engine().stats()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Writes the snapshot now; also happens when the store is dropped.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::ROOT_INODE_ID;
    use crate::test_helpers::{OWNER_GID, OWNER_UID, creds, owner_creds, test_fs};

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("ok.txt").is_ok());
        assert!(validate_filename(&"a".repeat(NAME_MAX)).is_ok());
        assert_eq!(
            validate_filename(&"a".repeat(NAME_MAX + 1)),
            Err(FsError::NameTooLong)
        );
        for bad in ["", ".", "..", "a/b"] {
            assert_eq!(validate_filename(bad), Err(FsError::InvalidArgument));
        }
    }

    #[test]
    fn test_open_missing_entry_is_invalid_argument() {
        let (_dir, fs) = test_fs();
        assert_eq!(
            fs.open(&owner_creds(), 4242, libc::O_RDONLY),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            fs.open(&owner_creds(), ROOT_INODE_ID, libc::O_RDONLY),
            Err(FsError::IsDirectory)
        );
    }

    #[test]
    fn test_lookup_needs_search_permission() {
        let (_dir, fs) = test_fs();
        let owner = owner_creds();
        let dir = fs.mkdir(&owner, ROOT_INODE_ID, "private", 0o700).unwrap();
        let (_, fh) = fs
            .create(&owner, dir.fileid, "f", 0o644, libc::O_WRONLY)
            .unwrap();
        fs.release(fh).unwrap();

        assert!(fs.lookup(&owner, dir.fileid, "f").is_ok());
        assert_eq!(
            fs.lookup(&creds(2000, 2000), dir.fileid, "f"),
            Err(FsError::PermissionDenied)
        );
    }

    #[test]
    fn test_write_handle_tracks_private_blob() {
        let (_dir, fs) = test_fs();
        let owner = owner_creds();
        let (src, fh) = fs
            .create(&owner, ROOT_INODE_ID, "src", 0o644, libc::O_WRONLY)
            .unwrap();
        fs.release(fh).unwrap();
        let engine = fs.store().engine();
        let alias = engine
            .cow_alias(ROOT_INODE_ID, "copy", 0o644, src.fileid, (OWNER_UID, OWNER_GID))
            .unwrap();
        let shared = alias.data_id().unwrap();

        let reader = fs.open(&owner, src.fileid, libc::O_RDONLY).unwrap();
        let writer = fs.open(&owner, alias.id, libc::O_RDWR).unwrap();
        assert_eq!(fs.open_handles(), 2);
        assert_eq!(fs.handles.get(reader).unwrap().data_id, shared);

        let private = fs.handles.get(writer).unwrap().data_id;
        assert_ne!(private, shared);
        assert_eq!(
            engine.lookup_entry(alias.id).unwrap().data_id(),
            Some(private)
        );

        fs.release(reader).unwrap();
        fs.release(writer).unwrap();
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_release_unknown_handle() {
        let (_dir, fs) = test_fs();
        assert_eq!(fs.release(99), Err(FsError::BadHandle));
        assert_eq!(fs.read(99, 0, 1), Err(FsError::BadHandle));
    }
}
