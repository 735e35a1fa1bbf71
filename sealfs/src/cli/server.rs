use anyhow::{Context, Result};
use fuser::{MountOption, Session, SessionUnmounter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::fs::SealFs;
use crate::fuse::SealFuse;

pub fn mount_options(settings: &Settings) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("sealfs".to_string()),
        MountOption::Subtype("sealfs".to_string()),
    ];
    if settings.mount.allow_other {
        options.push(MountOption::AllowOther);
    }
    if settings.mount.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    options
}

fn unmount(unmounter: &mut SessionUnmounter, mountpoint: &Path) {
    if let Err(e) = unmounter.unmount() {
        warn!("Failed to unmount {}: {}", mountpoint.display(), e);
    }
}

/// Locks the persistence root, mounts it at `mountpoint` and serves until
/// the filesystem is unmounted or the process gets SIGINT/SIGTERM. The
/// snapshot is flushed on the way out.
pub async fn run_server(settings: Settings, mountpoint: PathBuf) -> Result<()> {
    let root = settings.storage.root.clone();
    let fs = Arc::new(
        SealFs::open_root(&root)
            .with_context(|| format!("Failed to open persistence root {}", root.display()))?,
    );

    let adapter = SealFuse::new(
        Arc::clone(&fs),
        settings.mount.entry_ttl(),
        settings.mount.attr_ttl(),
    );
    let options = mount_options(&settings);
    let mut session = Session::new(adapter, &mountpoint, &options)
        .with_context(|| format!("Failed to mount at {}", mountpoint.display()))?;
    let mut unmounter = session.unmount_callable();
    info!("Serving {} at {}", root.display(), mountpoint.display());

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut worker = tokio::task::spawn_blocking(move || session.run());

    let result = tokio::select! {
        result = &mut worker => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, unmounting {}", mountpoint.display());
            unmount(&mut unmounter, &mountpoint);
            (&mut worker).await
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, unmounting {}", mountpoint.display());
            unmount(&mut unmounter, &mountpoint);
            (&mut worker).await
        }
    };

    match result {
        Ok(Ok(())) => info!("Session for {} ended", mountpoint.display()),
        Ok(Err(e)) => error!("FUSE session failed: {}", e),
        Err(e) => error!("FUSE session task failed: {}", e),
    }

    fs.flush().context("Failed to flush snapshot")?;
    info!("Snapshot written to {}", fs.store().snapshot_path().display());
    Ok(())
}
