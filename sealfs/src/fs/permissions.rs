use super::errors::FsError;
use super::inode::Inode;
use super::types::AuthContext;

const S_IRUSR: u32 = 0o400;
const S_IWUSR: u32 = 0o200;
const S_IXUSR: u32 = 0o100;
const S_IRGRP: u32 = 0o040;
const S_IWGRP: u32 = 0o020;
const S_IXGRP: u32 = 0o010;
const S_IROTH: u32 = 0o004;
const S_IWOTH: u32 = 0o002;
const S_IXOTH: u32 = 0o001;

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: [u32; 16],
    pub groups_count: usize,
}

impl Credentials {
    pub fn from_auth_context(auth: &AuthContext) -> Self {
        let mut creds = Self {
            uid: auth.uid,
            gid: auth.gid,
            groups: [0; 16],
            groups_count: auth.gids.len().min(16),
        };

        for (i, gid) in auth.gids.iter().take(16).enumerate() {
            creds.groups[i] = *gid;
        }

        creds
    }

    pub fn is_member_of_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups[..self.groups_count].contains(&gid)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

/// Access mode requested by an `open(2)`-style flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn from_flags(flags: i32) -> Result<Self, FsError> {
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Ok(OpenMode::ReadOnly),
            libc::O_WRONLY => Ok(OpenMode::WriteOnly),
            libc::O_RDWR => Ok(OpenMode::ReadWrite),
            _ => Err(FsError::InvalidArgument),
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, OpenMode::ReadOnly | OpenMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, OpenMode::WriteOnly | OpenMode::ReadWrite)
    }
}

/// Owner, then group, then other: the first class the caller falls into
/// decides. uid 0 bypasses everything except execute on a file with no
/// execute bit at all.
pub fn check_access(inode: &Inode, creds: &Credentials, mode: AccessMode) -> Result<(), FsError> {
    let (uid, gid, file_mode) = (inode.uid(), inode.gid(), inode.mode());

    if creds.uid == 0 {
        if let AccessMode::Execute = mode
            && inode.is_file()
            && file_mode & 0o111 == 0
        {
            return Err(FsError::PermissionDenied);
        }
        return Ok(());
    }

    let permission_bits = match mode {
        AccessMode::Read => (S_IRUSR, S_IRGRP, S_IROTH),
        AccessMode::Write => (S_IWUSR, S_IWGRP, S_IWOTH),
        AccessMode::Execute => (S_IXUSR, S_IXGRP, S_IXOTH),
    };

    let allowed = if creds.uid == uid {
        file_mode & permission_bits.0 != 0
    } else if creds.is_member_of_group(gid) {
        file_mode & permission_bits.1 != 0
    } else {
        file_mode & permission_bits.2 != 0
    };

    if allowed {
        Ok(())
    } else {
        Err(FsError::PermissionDenied)
    }
}

pub fn check_open(inode: &Inode, creds: &Credentials, mode: OpenMode) -> Result<(), FsError> {
    if mode.readable() {
        check_access(inode, creds, AccessMode::Read)?;
    }
    if mode.writable() {
        check_access(inode, creds, AccessMode::Write)?;
    }
    Ok(())
}

pub fn check_ownership(inode: &Inode, creds: &Credentials) -> Result<(), FsError> {
    if creds.uid == 0 || creds.uid == inode.uid() {
        Ok(())
    } else {
        Err(FsError::OperationNotPermitted)
    }
}

pub fn validate_mode(mode: u32) -> u32 {
    mode & 0o7777
}

pub fn can_set_times(
    inode: &Inode,
    creds: &Credentials,
    setting_to_current_time: bool,
) -> Result<(), FsError> {
    if creds.uid == 0 || creds.uid == inode.uid() {
        return Ok(());
    }

    if setting_to_current_time {
        return check_access(inode, creds, AccessMode::Write);
    }

    Err(FsError::OperationNotPermitted)
}
