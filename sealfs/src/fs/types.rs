use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::inode::InodeId;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;

// Default block size for stat
pub const DEFAULT_BLKSIZE: u32 = 4096;

// Block size for calculating block count
pub const BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
}

impl FileType {
    /// Type bits for the `st_mode` field.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
        }
    }
}

impl From<FileType> for fuser::FileType {
    fn from(ft: FileType) -> Self {
        match ft {
            FileType::Regular => fuser::FileType::RegularFile,
            FileType::Directory => fuser::FileType::Directory,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            seconds: since_epoch.as_secs(),
            nanoseconds: since_epoch.subsec_nanos(),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::new(ts.seconds, ts.nanoseconds)
    }
}

/// Attribute record as handed to the kernel, with the inode id mirrored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub file_type: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub fileid: InodeId,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl From<&FileAttributes> for fuser::FileAttr {
    fn from(attrs: &FileAttributes) -> Self {
        fuser::FileAttr {
            ino: attrs.fileid,
            size: attrs.size,
            blocks: attrs.size.div_ceil(BLOCK_SIZE),
            atime: attrs.atime.into(),
            mtime: attrs.mtime.into(),
            ctime: attrs.ctime.into(),
            crtime: attrs.ctime.into(),
            kind: attrs.file_type.into(),
            perm: (attrs.mode & 0o7777) as u16,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: DEFAULT_BLKSIZE,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SetMode {
    Set(u32),
    NoChange,
}

#[derive(Debug, Clone)]
pub enum SetUid {
    Set(u32),
    NoChange,
}

#[derive(Debug, Clone)]
pub enum SetGid {
    Set(u32),
    NoChange,
}

#[derive(Debug, Clone)]
pub enum SetSize {
    Set(u64),
    NoChange,
}

#[derive(Debug, Clone)]
pub enum SetTime {
    SetToClientTime(Timestamp),
    SetToServerTime,
    NoChange,
}

impl From<Option<fuser::TimeOrNow>> for SetTime {
    fn from(time: Option<fuser::TimeOrNow>) -> Self {
        match time {
            Some(fuser::TimeOrNow::SpecificTime(t)) => SetTime::SetToClientTime(t.into()),
            Some(fuser::TimeOrNow::Now) => SetTime::SetToServerTime,
            None => SetTime::NoChange,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetAttributes {
    pub mode: SetMode,
    pub uid: SetUid,
    pub gid: SetGid,
    pub size: SetSize,
    pub atime: SetTime,
    pub mtime: SetTime,
}

impl Default for SetAttributes {
    fn default() -> Self {
        Self {
            mode: SetMode::NoChange,
            uid: SetUid::NoChange,
            gid: SetGid::NoChange,
            size: SetSize::NoChange,
            atime: SetTime::NoChange,
            mtime: SetTime::NoChange,
        }
    }
}

/// Protocol-agnostic caller identity
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl From<&fuser::Request<'_>> for AuthContext {
    fn from(req: &fuser::Request<'_>) -> Self {
        // The kernel only forwards the primary group.
        Self {
            uid: req.uid(),
            gid: req.gid(),
            gids: vec![req.gid()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub inodes: u64,
    pub files: u64,
    pub directories: u64,
    pub used_bytes: u64,
}
