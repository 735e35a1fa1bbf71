use anyhow::{Context, Result, anyhow};
use std::path::{Component, Path};

use crate::config::Settings;
use crate::fs::errors::FsError;
use crate::fs::inode::{INVALID_INODE, InodeId, ROOT_INODE_ID};
use crate::fs::store::{Engine, StoreRoot, process_owner};

/// Walks `path` from the root, one name at a time.
fn resolve(engine: &Engine, path: &Path) -> Result<InodeId, FsError> {
    let mut id = ROOT_INODE_ID;
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                let parent = engine.get_parent(id);
                if parent != INVALID_INODE {
                    id = parent;
                }
            }
            Component::Normal(name) => {
                let name = name.to_str().ok_or(FsError::InvalidArgument)?;
                id = engine.lookup(id, name).ok_or(FsError::NotFound)?;
            }
            Component::Prefix(_) => return Err(FsError::InvalidArgument),
        }
    }
    Ok(id)
}

fn split_dest(dest: &Path) -> Result<(&Path, &str)> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Destination {} has no usable file name", dest.display()))?;
    Ok((dest.parent().unwrap_or(Path::new("")), name))
}

/// Creates `dest` as a copy-on-write alias of `source`: both entries share
/// one blob until either is opened for writing.
pub fn create_alias(settings: &Settings, source: &Path, dest: &Path, mode: u32) -> Result<()> {
    let root = &settings.storage.root;
    let store = StoreRoot::open(root)
        .with_context(|| format!("Failed to open persistence root {}", root.display()))?;
    let engine = store.engine();

    let source_id =
        resolve(engine, source).with_context(|| format!("Cannot resolve {}", source.display()))?;
    let (parent, name) = split_dest(dest)?;
    let parent_id =
        resolve(engine, parent).with_context(|| format!("Cannot resolve {}", parent.display()))?;

    let inode = engine
        .cow_alias(parent_id, name, mode, source_id, process_owner())
        .with_context(|| format!("Cannot alias {} as {}", source.display(), dest.display()))?;
    store.save().context("Failed to write snapshot")?;

    println!(
        "✓ {} -> inode {} (sharing data {} with inode {})",
        dest.display(),
        inode.id,
        inode.data_id().unwrap_or_default(),
        source_id
    );
    Ok(())
}
