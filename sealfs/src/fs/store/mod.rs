pub mod blob;
pub mod engine;
pub mod lock;
pub mod snapshot;
pub mod table;

pub use blob::BlobStore;
pub use engine::Engine;
pub use lock::RootLock;
pub use table::InodeTable;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use self::blob::parse_blob_file_name;
use self::snapshot::SNAPSHOT_FILE_NAME;
use super::errors::StoreError;
use super::inode::{DataId, InodeId};

const BAD_SNAPSHOT_SUFFIX: &str = "bad";

/// Findings from scanning the data directory against the loaded table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub stray_files: Vec<String>,
    pub orphaned_blobs: Vec<DataId>,
    pub missing_blobs: Vec<(InodeId, DataId)>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.stray_files.is_empty() && self.orphaned_blobs.is_empty() && self.missing_blobs.is_empty()
    }
}

/// An opened persistence root: the held lock plus the loaded engine.
pub struct StoreRoot {
    path: PathBuf,
    engine: Engine,
    save_on_drop: bool,
    _lock: RootLock,
}

/// Effective uid/gid of this process, used as the owner of a fresh root.
pub fn process_owner() -> (u32, u32) {
    (
        rustix::process::geteuid().as_raw(),
        rustix::process::getegid().as_raw(),
    )
}

impl StoreRoot {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        Self::open_with_owner(root, process_owner())
    }

    /// Locks `root`, prepares the data directory and loads the snapshot.
    /// A snapshot that fails to load is moved aside and replaced by an
    /// empty root.
    pub fn open_with_owner(root: &Path, owner: (u32, u32)) -> Result<Self, StoreError> {
        let lock = RootLock::acquire(root)?;

        let blobs = BlobStore::new(root);
        blobs.ensure_dir()?;

        let snapshot_path = root.join(SNAPSHOT_FILE_NAME);
        let table = match snapshot::load(&snapshot_path, owner) {
            Ok(table) => table,
            Err(e) => {
                error!("Failed to load {}: {}", snapshot_path.display(), e);
                let aside = snapshot_path.with_extension(format!("json.{BAD_SNAPSHOT_SUFFIX}"));
                std::fs::rename(&snapshot_path, &aside)?;
                warn!(
                    "Moved unreadable snapshot to {}; starting with an empty root",
                    aside.display()
                );
                InodeTable::bootstrap(owner.0, owner.1)
            }
        };
        info!(
            "Opened persistence root {} ({} inodes)",
            root.display(),
            table.len()
        );

        Ok(Self {
            path: root.to_path_buf(),
            engine: Engine::new(table, blobs),
            save_on_drop: true,
            _lock: lock,
        })
    }

    /// Locks and loads `root` for inspection. Apart from the lock file,
    /// nothing on disk is created or rewritten, and a bad snapshot is an error.
    pub fn inspect(root: &Path) -> Result<Self, StoreError> {
        let lock = RootLock::acquire(root)?;
        let table = snapshot::load(&root.join(SNAPSHOT_FILE_NAME), process_owner())?;
        Ok(Self {
            path: root.to_path_buf(),
            engine: Engine::new(table, BlobStore::new(root)),
            save_on_drop: false,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE_NAME)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let path = self.snapshot_path();
        self.engine.with_table(|table| snapshot::save(&path, table))
    }

    /// Cross-checks `data/` against the table. With `repair`, missing
    /// blobs of file entries are recreated empty.
    pub fn validate(&self, repair: bool) -> Result<ValidationReport, StoreError> {
        let blobs = self.engine.blobs();
        let mut report = ValidationReport::default();

        let referenced: HashSet<DataId> = self
            .engine
            .with_table(|table| table.referenced_data_ids().collect());

        let entries = match std::fs::read_dir(blobs.dir()) {
            Ok(entries) => entries.collect::<Result<Vec<_>, _>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Data directory {} is missing", blobs.dir().display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);

            match parse_blob_file_name(&name) {
                Some(data_id) if is_file => {
                    if !referenced.contains(&data_id) {
                        warn!("Orphaned blob {} in {}", name, blobs.dir().display());
                        report.orphaned_blobs.push(data_id);
                    }
                }
                _ => {
                    warn!("Unexpected entry {:?} in {}", name, blobs.dir().display());
                    report.stray_files.push(name);
                }
            }
        }

        let files: Vec<(InodeId, DataId)> = self.engine.with_table(|table| {
            table
                .inodes()
                .filter_map(|inode| inode.data_id().map(|d| (inode.id, d)))
                .collect()
        });
        for (id, data_id) in files {
            if blobs.exists(data_id) {
                continue;
            }
            warn!("Blob {} of inode {} is missing", data_id, id);
            if repair {
                blobs.create_empty(data_id)?;
                warn!("Recreated blob {} empty", data_id);
            }
            report.missing_blobs.push((id, data_id));
        }

        report.stray_files.sort();
        report.orphaned_blobs.sort_unstable();
        report.missing_blobs.sort_unstable();
        Ok(report)
    }
}

impl Drop for StoreRoot {
    fn drop(&mut self) {
        if !self.save_on_drop {
            return;
        }
        if let Err(e) = self.save() {
            error!("Failed to flush snapshot for {}: {}", self.path.display(), e);
        }
    }
}
