use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{Settings, expand_tilde};

pub mod alias;
pub mod debug;
pub mod server;

#[derive(Parser)]
#[command(name = "sealfs")]
#[command(author, version, about = "A FUSE filesystem backed by a local directory of blobs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Where to find the persistence root: a config file, overridden by `--root`.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Persistence root (overrides the config file)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

impl StoreArgs {
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Settings::resolved_default(),
        };
        if let Some(root) = &self.root {
            settings.storage.root = expand_tilde(root);
        }
        Ok(settings)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file and create the persistence root it names
    Init {
        #[arg(default_value = "sealfs.toml")]
        path: PathBuf,
    },
    /// Mount the filesystem and serve requests until unmounted
    Run {
        #[command(flatten)]
        store: StoreArgs,
        /// Mountpoint (overrides the config file)
        mountpoint: Option<PathBuf>,
        /// Let other users access the mount
        #[arg(long)]
        allow_other: bool,
        /// Log file (overrides the config file)
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Create a copy-on-write alias of a file while the root is not mounted
    ///
    /// Paths are relative to the filesystem root, e.g.
    ///
    /// sealfs alias --root ~/.sealfs docs/report.txt docs/report-draft.txt
    Alias {
        #[command(flatten)]
        store: StoreArgs,
        /// Existing file
        source: PathBuf,
        /// New entry; its parent directory must exist
        dest: PathBuf,
        /// Permission bits of the new entry, in octal
        #[arg(long, default_value = "644", value_parser = parse_octal_mode)]
        mode: u32,
    },
    /// Debug commands for inspecting a persistence root
    Debug {
        #[command(subcommand)]
        subcommand: DebugCommands,
    },
}

#[derive(Subcommand)]
pub enum DebugCommands {
    /// List every inode in id order
    ListInodes {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Check the data directory against the snapshot without changing anything
    Check {
        #[command(flatten)]
        store: StoreArgs,
    },
}

fn parse_octal_mode(s: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid octal mode {s:?}: {e}"))?;
    if mode > 0o7777 {
        return Err(format!("mode {s} is out of range"));
    }
    Ok(mode)
}

/// Creates the configured persistence root if it does not exist yet.
pub fn create_root(settings: &Settings) -> Result<&Path> {
    let root = settings.storage.root.as_path();
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create persistence root {}", root.display()))?;
    Ok(root)
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
