use anyhow::{Context, Result, bail};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;
mod fs;
mod fuse;

#[cfg(test)]
mod test_helpers;


#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const DEFAULT_FILTER: &str = "sealfs=info";

/// Installs the global subscriber. With a log file, output goes there
/// without ANSI colors instead of to stderr.
fn init_tracing(level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_FILTER)))
        .context("Invalid log level")?;

    let (console, file) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => (Some(fmt::layer().with_writer(std::io::stderr)), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse_args();

    match cli.command {
        cli::Commands::Init { path } => {
            println!("Generating configuration file at: {}", path.display());
            config::Settings::write_default_config(&path)?;
            println!("Configuration file created successfully!");
            let settings = config::Settings::from_file(&path)?;
            let root = cli::create_root(&settings)?;
            println!("Persistence root ready at: {}", root.display());
            println!(
                "Edit the file and run: sealfs run -c {} <mountpoint>",
                path.display()
            );
        }
        cli::Commands::Run {
            store,
            mountpoint,
            allow_other,
            log_file,
        } => {
            let mut settings = store.settings()?;
            if let Some(mountpoint) = mountpoint {
                settings.mount.mountpoint = Some(config::expand_tilde(&mountpoint));
            }
            if allow_other {
                settings.mount.allow_other = true;
            }
            if let Some(log_file) = log_file {
                settings.logging.file = Some(config::expand_tilde(&log_file));
            }

            init_tracing(
                settings.logging.level.as_deref(),
                settings.logging.file.as_deref(),
            )?;

            let Some(mountpoint) = settings.mount.mountpoint.clone() else {
                bail!("No mountpoint given on the command line or in the config file");
            };
            cli::server::run_server(settings, mountpoint).await?;
        }
        cli::Commands::Alias {
            store,
            source,
            dest,
            mode,
        } => {
            let settings = store.settings()?;
            init_tracing(settings.logging.level.as_deref(), None)?;
            cli::alias::create_alias(&settings, &source, &dest, mode)?;
        }
        cli::Commands::Debug { subcommand } => match subcommand {
            cli::DebugCommands::ListInodes { store } => {
                let settings = store.settings()?;
                init_tracing(settings.logging.level.as_deref(), None)?;
                cli::debug::list_inodes(&settings)?;
            }
            cli::DebugCommands::Check { store } => {
                let settings = store.settings()?;
                init_tracing(settings.logging.level.as_deref(), None)?;
                cli::debug::check(&settings)?;
            }
        },
    }

    Ok(())
}
