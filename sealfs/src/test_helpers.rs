use tempfile::TempDir;

use crate::fs::SealFs;
use crate::fs::permissions::Credentials;
use crate::fs::store::StoreRoot;
use crate::fs::types::AuthContext;

pub const OWNER_UID: u32 = 1000;
pub const OWNER_GID: u32 = 1000;

/// A filesystem over a fresh temporary root. Keep the `TempDir` alive for
/// as long as the filesystem.
pub fn test_fs() -> (TempDir, SealFs) {
    let dir = TempDir::new().unwrap();
    let store = StoreRoot::open_with_owner(dir.path(), (0, 0)).unwrap();
    let fs = SealFs::new(store);
    fs.init().unwrap();
    (dir, fs)
}

/// Reopens the root left behind by a dropped filesystem.
pub fn reopen(dir: &TempDir) -> SealFs {
    SealFs::new(StoreRoot::open_with_owner(dir.path(), (0, 0)).unwrap())
}

pub fn creds(uid: u32, gid: u32) -> Credentials {
    Credentials::from_auth_context(&AuthContext {
        uid,
        gid,
        gids: vec![gid],
    })
}

pub fn owner_creds() -> Credentials {
    creds(OWNER_UID, OWNER_GID)
}

pub fn root_creds() -> Credentials {
    creds(0, 0)
}
