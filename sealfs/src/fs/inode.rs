use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{FileAttributes, FileType, Timestamp};

pub type InodeId = u64;
pub type DataId = u64;

/// The kernel's fixed root inode number.
pub const ROOT_INODE_ID: InodeId = 1;
/// Sentinel for "no such inode"; the root's parent.
pub const INVALID_INODE: InodeId = u64::MAX;

pub const FIRST_INODE_ID: InodeId = ROOT_INODE_ID + 1;
pub const FIRST_DATA_ID: DataId = 1;

/// Highest id ever handed out. Listing cookies are `id + 2` and travel to
/// the kernel as an `i64`.
pub const MAX_INODE_ID: InodeId = i64::MAX as u64 - 2;
pub const MAX_DATA_ID: DataId = u64::MAX - 1;

// Reported st_size of every directory
pub const DIRECTORY_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeKind {
    File,
    Dir,
}

impl From<InodeKind> for FileType {
    fn from(kind: InodeKind) -> Self {
        match kind {
            InodeKind::File => FileType::Regular,
            InodeKind::Dir => FileType::Directory,
        }
    }
}

/// POSIX stat subset kept for every entry. `mode` carries the type bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttrs {
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl InodeAttrs {
    pub fn new(kind: InodeKind, mode: u32, uid: u32, gid: u32) -> Self {
        let now = Timestamp::now();
        let (size, nlink) = match kind {
            InodeKind::File => (0, 1),
            InodeKind::Dir => (DIRECTORY_SIZE, 2),
        };
        Self {
            size,
            nlink,
            mode: FileType::from(kind).mode_bits() | (mode & 0o777),
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Kind-specific payload. Children exist only on directories and a data id
/// only on files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InodeData {
    File { data_id: DataId },
    Dir { children: HashMap<String, InodeId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: InodeId,
    pub parent: InodeId,
    pub name: String,
    pub attrs: InodeAttrs,
    #[serde(flatten)]
    pub data: InodeData,
}

impl Inode {
    pub fn kind(&self) -> InodeKind {
        match self.data {
            InodeData::File { .. } => InodeKind::File,
            InodeData::Dir { .. } => InodeKind::Dir,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.data, InodeData::Dir { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.data, InodeData::File { .. })
    }

    pub fn data_id(&self) -> Option<DataId> {
        match self.data {
            InodeData::File { data_id } => Some(data_id),
            InodeData::Dir { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&HashMap<String, InodeId>> {
        match &self.data {
            InodeData::Dir { children } => Some(children),
            InodeData::File { .. } => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut HashMap<String, InodeId>> {
        match &mut self.data {
            InodeData::Dir { children } => Some(children),
            InodeData::File { .. } => None,
        }
    }

    pub fn uid(&self) -> u32 {
        self.attrs.uid
    }

    pub fn gid(&self) -> u32 {
        self.attrs.gid
    }

    pub fn mode(&self) -> u32 {
        self.attrs.mode
    }

    pub fn attributes(&self) -> FileAttributes {
        FileAttributes {
            file_type: self.kind().into(),
            mode: self.attrs.mode,
            nlink: self.attrs.nlink,
            uid: self.attrs.uid,
            gid: self.attrs.gid,
            size: self.attrs.size,
            fileid: self.id,
            atime: self.attrs.atime,
            mtime: self.attrs.mtime,
            ctime: self.attrs.ctime,
        }
    }
}
