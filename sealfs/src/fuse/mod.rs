use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use rustix::fs::statvfs;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use crate::fs::dirbuf::parse_entries;
use crate::fs::errors::FsError;
use crate::fs::permissions::Credentials;
use crate::fs::types::{
    AuthContext, BLOCK_SIZE, FileAttributes, FsStats, SetAttributes, SetGid, SetMode, SetSize, SetUid,
};
use crate::fs::{NAME_MAX, SealFs};

// Upper bound on one readdir window; `ReplyDirectory` stops us earlier
// once the kernel buffer is full.
const READDIR_WINDOW: usize = 128 * 1024;

/// Bridges kernel requests onto [`SealFs`]. Each callback converts the
/// request, runs the handler, and sends exactly one reply.
pub struct SealFuse {
    fs: Arc<SealFs>,
    entry_ttl: Duration,
    attr_ttl: Duration,
}

impl SealFuse {
    pub fn new(fs: Arc<SealFs>, entry_ttl: Duration, attr_ttl: Duration) -> Self {
        Self {
            fs,
            entry_ttl,
            attr_ttl,
        }
    }
}

fn creds(req: &Request<'_>) -> Credentials {
    Credentials::from_auth_context(&AuthContext::from(req))
}

fn name_str(name: &OsStr) -> Result<&str, FsError> {
    name.to_str().ok_or(FsError::InvalidArgument)
}

fn fuse_attr(attrs: &FileAttributes) -> FileAttr {
    attrs.into()
}

#[derive(Debug, PartialEq, Eq)]
struct VolumeStats {
    blocks: u64,
    bfree: u64,
    bavail: u64,
    files: u64,
    ffree: u64,
    bsize: u32,
    namelen: u32,
    frsize: u32,
}

/// Block counts come from the volume under the persistence root. If that
/// cannot be read, only our own usage is reported.
fn volume_stats(stats: &FsStats, root: &Path) -> VolumeStats {
    match statvfs(root) {
        Ok(st) => VolumeStats {
            blocks: st.f_blocks,
            bfree: st.f_bfree,
            bavail: st.f_bavail,
            files: stats.inodes.saturating_add(st.f_ffree),
            ffree: st.f_ffree,
            bsize: st.f_bsize as u32,
            namelen: NAME_MAX as u32,
            frsize: st.f_frsize as u32,
        },
        Err(e) => {
            debug!("statvfs on backing root failed: {}", e);
            VolumeStats {
                blocks: stats.used_bytes.div_ceil(BLOCK_SIZE),
                bfree: 0,
                bavail: 0,
                files: stats.inodes,
                ffree: 0,
                bsize: BLOCK_SIZE as u32,
                namelen: NAME_MAX as u32,
                frsize: BLOCK_SIZE as u32,
            }
        }
    }
}

impl Filesystem for SealFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        match self.fs.init() {
            Ok(_) => {
                info!("sealfs mounted over {}", self.fs.store().path().display());
                Ok(())
            }
            Err(e) => {
                error!("Startup validation failed: {}", e);
                Err(libc::EIO)
            }
        }
    }

    fn destroy(&mut self) {
        let open = self.fs.open_handles();
        if open > 0 {
            info!("Unmounting with {} open handles", open);
        }
        match self.fs.flush() {
            Ok(()) => info!("Snapshot flushed on unmount"),
            Err(e) => error!("Failed to flush snapshot on unmount: {}", e),
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = name_str(name).and_then(|name| self.fs.lookup(&creds(req), parent, name));
        match result {
            Ok(attrs) => reply.entry(&self.entry_ttl, &fuse_attr(&attrs), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(attrs) => reply.attr(&self.attr_ttl, &fuse_attr(&attrs)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let setattr = SetAttributes {
            mode: mode.map_or(SetMode::NoChange, SetMode::Set),
            uid: uid.map_or(SetUid::NoChange, SetUid::Set),
            gid: gid.map_or(SetGid::NoChange, SetGid::Set),
            size: size.map_or(SetSize::NoChange, SetSize::Set),
            atime: atime.into(),
            mtime: mtime.into(),
        };
        match self.fs.setattr(&creds(req), ino, &setattr) {
            Ok(attrs) => reply.attr(&self.attr_ttl, &fuse_attr(&attrs)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result =
            name_str(name).and_then(|name| self.fs.mkdir(&creds(req), parent, name, mode & !umask));
        match result {
            Ok(attrs) => reply.entry(&self.entry_ttl, &fuse_attr(&attrs), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match name_str(name).and_then(|name| self.fs.unlink(&creds(req), parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match name_str(name).and_then(|name| self.fs.rmdir(&creds(req), parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let result = name_str(name).and_then(|name| {
            let newname = name_str(newname)?;
            self.fs.rename(&creds(req), parent, name, newparent, newname)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(&creds(req), ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => {
                debug!("open of inode {} failed: {}", ino, e);
                reply.error(e.to_errno())
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.opendir(&creds(req), ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        // The offset is the cookie of the last entry the kernel took.
        let Ok(cookie) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.readdir(ino, cookie, READDIR_WINDOW) {
            Ok(window) => {
                for entry in parse_entries(&window) {
                    let kind = entry
                        .file_type
                        .map(Into::into)
                        .unwrap_or(fuser::FileType::Directory);
                    let Ok(next) = i64::try_from(entry.cookie) else {
                        break;
                    };
                    if reply.add(entry.ino, next, kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = volume_stats(&self.fs.statfs(), self.fs.store().path());
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = name_str(name)
            .and_then(|name| self.fs.create(&creds(req), parent, name, mode & !umask, flags));
        match result {
            Ok((attrs, fh)) => reply.created(&self.entry_ttl, &fuse_attr(&attrs), 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
