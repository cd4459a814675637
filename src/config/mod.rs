//! Configuration for Quartermaster.
//!
//! ## config.kdl
//!
//! Located at:
//! - System: `$QM_CONFIG_DIR/config.kdl`, else `~/.config/quartermaster/config.kdl`
//! - Workspace: `<data-dir>/config.kdl`
//!
//! Holds tracker and test-bank connection settings, sync tuning and the
//! output format. See [`schema`] for the layout.
//!
//! ## Security
//!
//! config.kdl carries API tokens and passwords, so it is written with 0600
//! permissions on Unix.
//!
//! ## Precedence
//!
//! env var > workspace config > system config > defaults. Use [`load`] to
//! read both files and resolve them in one step.

pub mod resolver;
pub mod schema;

pub use resolver::{ConfigEntry, Resolved, ResolvedConfig, ValueSource, mask_secret, resolve_config};
#[cfg(unix)]
pub use schema::CONFIG_FILE_MODE;
pub use schema::{OutputFormat, QmConfig};

use crate::{Error, Result};
use kdl::KdlDocument;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the config inside a config directory.
pub const CONFIG_FILE: &str = "config.kdl";

/// Environment variable overriding the system config directory.
pub const CONFIG_DIR_ENV: &str = "QM_CONFIG_DIR";

/// Workspace config.kdl inside the data directory.
pub fn workspace_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// System config.kdl, if a config directory can be determined.
pub fn system_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Some(PathBuf::from(dir).join(CONFIG_FILE));
    }
    dirs::config_dir().map(|dir| dir.join("quartermaster").join(CONFIG_FILE))
}

/// Read a config file. A missing file is an empty config.
pub fn read_config(path: &Path) -> Result<QmConfig> {
    if !path.exists() {
        return Ok(QmConfig::default());
    }
    let content = fs::read_to_string(path)?;
    let doc: KdlDocument = content.parse()?;
    let config = QmConfig::from_kdl(&doc);
    config
        .validate()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(config)
}

/// Write a config file with owner-only permissions.
pub fn write_config(path: &Path, config: &QmConfig) -> Result<()> {
    config.validate().map_err(Error::Config)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config.to_kdl().to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
    }
    Ok(())
}

/// Read the workspace and system files and resolve them against the environment.
pub fn load(data_dir: &Path) -> Result<ResolvedConfig> {
    let workspace = read_config(&workspace_config_path(data_dir))?;
    let system = match system_config_path() {
        Some(path) => read_config(&path)?,
        None => QmConfig::default(),
    };
    resolve_config(&workspace, &system)
}

/// Set one key in the workspace config and return the file path.
pub fn set_workspace_value(data_dir: &Path, key: &str, value: &str) -> Result<PathBuf> {
    let path = workspace_config_path(data_dir);
    let mut config = read_config(&path)?;
    config.set(key, value).map_err(Error::Config)?;
    write_config(&path, &config)?;
    tracing::info!(key, path = %path.display(), "config updated");
    Ok(path)
}
