use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ROOT: &str = "~/.sealfs";
const DEFAULT_LOG_FILE: &str = "~/sealfs.log";
const DEFAULT_TIMEOUT_SECS: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the snapshot, the blobs and the lock file.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    #[serde(default)]
    pub allow_other: bool,
    #[serde(default = "default_true")]
    pub auto_unmount: bool,
    #[serde(default = "default_timeout")]
    pub entry_timeout_secs: f64,
    #[serde(default = "default_timeout")]
    pub attr_timeout_secs: f64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mountpoint: None,
            allow_other: false,
            auto_unmount: true,
            entry_timeout_secs: DEFAULT_TIMEOUT_SECS,
            attr_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl MountConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.entry_timeout_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS))
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.attr_timeout_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log file; stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Filter directive used when RUST_LOG is not set, e.g. "sealfs=debug".
    #[serde(default)]
    pub level: Option<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

/// Resolves a leading `~` component against the caller's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(content).context("Failed to parse TOML")?;
        settings.validate()?;
        settings.expand_paths();
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("entry_timeout_secs", self.mount.entry_timeout_secs),
            ("attr_timeout_secs", self.mount.attr_timeout_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                bail!("mount.{name} must be a non-negative number of seconds, got {secs}");
            }
        }
        if self.storage.root.as_os_str().is_empty() {
            bail!("storage.root must not be empty");
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.storage.root = expand_tilde(&self.storage.root);
        if let Some(mountpoint) = &self.mount.mountpoint {
            self.mount.mountpoint = Some(expand_tilde(mountpoint));
        }
        if let Some(file) = &self.logging.file {
            self.logging.file = Some(expand_tilde(file));
        }
    }

    /// Defaults with paths resolved, for when no config file is given.
    pub fn resolved_default() -> Self {
        let mut settings = Self::default();
        settings.expand_paths();
        settings
    }

    pub fn default_config_template() -> String {
        format!(
            r#"# sealfs configuration

[storage]
# Persistence root: structure.json, data/ and the lock file live here.
root = "{DEFAULT_ROOT}"

[mount]
# Where `sealfs run` mounts when no mountpoint is given on the command line.
# mountpoint = "~/sealfs"
allow_other = false
auto_unmount = true
# Kernel cache lifetimes for entries and attributes.
entry_timeout_secs = {DEFAULT_TIMEOUT_SECS:.1}
attr_timeout_secs = {DEFAULT_TIMEOUT_SECS:.1}

[logging]
# Log to a file instead of stderr.
# file = "{DEFAULT_LOG_FILE}"
# Used when RUST_LOG is unset.
# level = "sealfs=info"
"#
        )
    }

    pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            bail!("Refusing to overwrite existing file {}", path.display());
        }
        std::fs::write(path, Self::default_config_template())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_template_round_trips() {
        let parsed = Settings::from_toml(&Settings::default_config_template()).unwrap();
        assert_eq!(parsed, Settings::resolved_default());
        assert!(parsed.mount.auto_unmount);
        assert_eq!(parsed.mount.entry_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_tilde_expansion() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_tilde(Path::new("~/.sealfs")), home.join(".sealfs"));
        assert_eq!(expand_tilde(Path::new("~")), home);
        assert_eq!(expand_tilde(Path::new("/srv/data")), PathBuf::from("/srv/data"));
        assert_eq!(expand_tilde(Path::new("~other/x")), PathBuf::from("~other/x"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let settings = Settings::from_toml(
            r#"
            [storage]
            root = "/var/lib/sealfs"

            [mount]
            mountpoint = "/mnt/seal"
            attr_timeout_secs = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(settings.storage.root, PathBuf::from("/var/lib/sealfs"));
        assert_eq!(settings.mount.mountpoint, Some(PathBuf::from("/mnt/seal")));
        assert_eq!(settings.mount.attr_ttl(), Duration::from_millis(500));
        assert_eq!(settings.mount.entry_ttl(), Duration::from_secs(1));
        assert!(settings.logging.file.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Settings::from_toml("[mount]\nentry_timeout_secs = -1.0\n").is_err());
        assert!(Settings::from_toml("[storage]\nroot = \"\"\n").is_err());
        assert!(Settings::from_toml("[storage]\nurl = \"s3://x\"\n").is_err());
    }

    #[test]
    fn test_write_default_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sealfs.toml");
        Settings::write_default_config(&path).unwrap();
        assert!(Settings::from_file(&path).is_ok());
        assert!(Settings::write_default_config(&path).is_err());
    }
}
