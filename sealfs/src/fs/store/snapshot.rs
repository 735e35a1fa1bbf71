use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info};

use super::table::InodeTable;
use crate::fs::errors::StoreError;
use crate::fs::inode::{DataId, FIRST_DATA_ID, FIRST_INODE_ID, Inode, InodeId};

pub const SNAPSHOT_FILE_NAME: &str = "structure.json";

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    next_inode_id: InodeId,
    #[serde(default)]
    next_data_id: DataId,
    inodes: HashMap<InodeId, Inode>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    next_inode_id: InodeId,
    next_data_id: DataId,
    inodes: BTreeMap<InodeId, &'a Inode>,
}

/// Reads the snapshot at `path`. A missing or blank file yields a table
/// holding only a root directory owned by `owner`.
pub fn load(path: &Path, owner: (u32, u32)) -> Result<InodeTable, StoreError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No snapshot at {}; starting with an empty root", path.display());
            return Ok(InodeTable::bootstrap(owner.0, owner.1));
        }
        Err(e) => return Err(e.into()),
    };

    if data.iter().all(u8::is_ascii_whitespace) {
        info!("Snapshot {} is empty; starting with an empty root", path.display());
        return Ok(InodeTable::bootstrap(owner.0, owner.1));
    }

    let snapshot: Snapshot = serde_json::from_slice(&data)?;
    debug!(
        "Loaded {} inodes from {} (recorded counters: inode {}, data {})",
        snapshot.inodes.len(),
        path.display(),
        snapshot.next_inode_id,
        snapshot.next_data_id
    );

    Ok(InodeTable::from_inodes(
        snapshot.inodes,
        snapshot.next_inode_id.max(FIRST_INODE_ID),
        snapshot.next_data_id.max(FIRST_DATA_ID),
        owner,
    ))
}

/// Truncates and rewrites the snapshot in place. A crash mid-write leaves a
/// partial file behind.
pub fn save(path: &Path, table: &InodeTable) -> Result<(), StoreError> {
    let snapshot = SnapshotRef {
        next_inode_id: table.next_inode_id(),
        next_data_id: table.next_data_id(),
        inodes: table.inodes().map(|inode| (inode.id, inode)).collect(),
    };
    let data = serde_json::to_vec_pretty(&snapshot)?;

    let mut file = File::create(path)?;
    file.write_all(&data)?;
    file.sync_all()?;

    debug!("Wrote {} inodes to {}", table.len(), path.display());
    Ok(())
}
