use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::inode::{Inode, InodeId};
use super::types::FileType;

const DT_UNKNOWN: u32 = 0;
const DT_DIR: u32 = 4;
const DT_REG: u32 = 8;

// ino + off + namelen + type
const DIRENT_HEADER_LEN: usize = 24;
const DIRENT_ALIGN: usize = 8;

fn dirent_len(name_len: usize) -> usize {
    (DIRENT_HEADER_LEN + name_len).next_multiple_of(DIRENT_ALIGN)
}

/// A listing packed as kernel `fuse_dirent` records.
///
/// Each record's `off` is the caller's cookie for that entry, which the
/// kernel hands back to resume after it. Cookies must be added in
/// ascending order; [`DirBuf::resume_offset`] maps one back to the byte
/// offset of the next record, so a listing rebuilt after the directory
/// changed still resumes on a record boundary.
#[derive(Debug, Default)]
pub struct DirBuf {
    buf: BytesMut,
    // (cookie, byte offset where the record starts)
    records: Vec<(u64, usize)>,
}

/// One record read back out of a [`DirBuf`] reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeId,
    pub cookie: u64,
    pub file_type: Option<FileType>,
    pub name: String,
}

impl DirBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `name` under `cookie`. `None` yields a zeroed record, used
    /// for `..` at the root.
    pub fn add_entry(&mut self, name: &str, inode: Option<&Inode>, cookie: u64) {
        let (ino, dtype) = match inode {
            Some(inode) => (
                inode.id,
                match FileType::from(inode.kind()) {
                    FileType::Directory => DT_DIR,
                    FileType::Regular => DT_REG,
                },
            ),
            None => (0, DT_UNKNOWN),
        };

        let start = self.buf.len();
        let len = dirent_len(name.len());
        self.buf.reserve(len);
        self.records.push((cookie, start));
        self.buf.put_u64_le(ino);
        self.buf.put_u64_le(cookie);
        self.buf.put_u32_le(name.len() as u32);
        self.buf.put_u32_le(dtype);
        self.buf.put_slice(name.as_bytes());
        self.buf.resize(start + len, 0);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Byte offset of the first record whose cookie is past `cookie`, or
    /// the end of the buffer when there is none.
    pub fn resume_offset(&self, cookie: u64) -> u64 {
        let next = self.records.partition_point(|(c, _)| *c <= cookie);
        self.records
            .get(next)
            .map_or(self.len(), |(_, start)| *start) as u64
    }

    /// The `[offset, offset + max_size)` window, empty at or past the end.
    pub fn reply(&self, offset: u64, max_size: usize) -> Bytes {
        let len = self.buf.len();
        let Ok(start) = usize::try_from(offset) else {
            return Bytes::new();
        };
        if start >= len {
            return Bytes::new();
        }
        let end = start.saturating_add(max_size).min(len);
        Bytes::copy_from_slice(&self.buf[start..end])
    }
}

/// Decodes the complete records at the front of `data`. A trailing partial
/// record is left for the next request.
pub fn parse_entries(mut data: &[u8]) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    while data.len() >= DIRENT_HEADER_LEN {
        let mut header = &data[..DIRENT_HEADER_LEN];
        let ino = header.get_u64_le();
        let cookie = header.get_u64_le();
        let name_len = header.get_u32_le() as usize;
        let dtype = header.get_u32_le();

        let len = dirent_len(name_len);
        if data.len() < len {
            break;
        }
        let name = &data[DIRENT_HEADER_LEN..DIRENT_HEADER_LEN + name_len];
        entries.push(DirEntry {
            ino,
            cookie,
            file_type: match dtype {
                DT_DIR => Some(FileType::Directory),
                DT_REG => Some(FileType::Regular),
                _ => None,
            },
            name: String::from_utf8_lossy(name).into_owned(),
        });
        data.advance(len);
    }
    entries
}
