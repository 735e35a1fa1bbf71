use anyhow::{Context, Result};
use comfy_table::{Table, presets::UTF8_FULL};

use crate::config::Settings;
use crate::fs::inode::{INVALID_INODE, Inode, InodeData};
use crate::fs::store::{InodeTable, StoreRoot};

fn open(settings: &Settings) -> Result<StoreRoot> {
    let root = &settings.storage.root;
    StoreRoot::inspect(root)
        .with_context(|| format!("Failed to open persistence root {}", root.display()))
}

const HEADER: [&str; 8] = ["Inode", "Parent", "Mode", "Uid", "Gid", "Size", "Data", "Name"];

fn row(inode: &Inode) -> Vec<String> {
    let data = match &inode.data {
        InodeData::File { data_id } => format!("blob {data_id}"),
        InodeData::Dir { children } => format!("{} entries", children.len()),
    };
    let parent = if inode.parent == INVALID_INODE {
        "-".to_string()
    } else {
        inode.parent.to_string()
    };
    vec![
        inode.id.to_string(),
        parent,
        format!("{:06o}", inode.attrs.mode),
        inode.attrs.uid.to_string(),
        inode.attrs.gid.to_string(),
        inode.attrs.size.to_string(),
        data,
        format!("{:?}", inode.name),
    ]
}

fn sorted(table: &InodeTable) -> Vec<&Inode> {
    let mut inodes: Vec<_> = table.inodes().collect();
    inodes.sort_by_key(|inode| inode.id);
    inodes
}

pub fn list_inodes(settings: &Settings) -> Result<()> {
    let store = open(settings)?;
    let engine = store.engine();

    println!("Inodes in {}:", store.path().display());
    engine.with_table(|inodes| {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(HEADER.to_vec());
        for inode in sorted(inodes) {
            table.add_row(row(inode));
        }
        println!("{table}");
        println!(
            "next_inode_id={} next_data_id={}",
            inodes.next_inode_id(),
            inodes.next_data_id()
        );
    });

    let stats = engine.stats();
    println!("\n=== Summary ===");
    println!("Total inodes: {}", stats.inodes);
    println!("  files: {}", stats.files);
    println!("  directories: {}", stats.directories);
    println!("Bytes in files: {}", stats.used_bytes);
    Ok(())
}

pub fn check(settings: &Settings) -> Result<()> {
    let store = open(settings)?;
    let report = store.validate(false)?;

    if report.is_clean() {
        println!("✓ {} is consistent", store.path().display());
        return Ok(());
    }

    for name in &report.stray_files {
        println!("stray file: data/{name}");
    }
    for data_id in &report.orphaned_blobs {
        println!("orphaned blob: {data_id}");
    }
    for (id, data_id) in &report.missing_blobs {
        println!("missing blob: {data_id} (inode {id})");
    }
    println!(
        "\n✗ {} stray, {} orphaned, {} missing",
        report.stray_files.len(),
        report.orphaned_blobs.len(),
        report.missing_blobs.len()
    );
    Ok(())
}
