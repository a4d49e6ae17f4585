//! Filesystem locations for the control plane's own state.
//!
//! Everything lives under `~/.warden` unless `WARDEN_HOME` overrides it.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Returns the warden home directory, `~/.warden` by default.
/// Honors the `WARDEN_HOME` environment variable.
pub fn warden_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("WARDEN_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".warden"))
}

/// Default location of the checkpoint database.
pub fn default_database_path() -> Result<PathBuf> {
    Ok(warden_home_dir()?.join("warden.db"))
}

/// Default directory for the audit trail.
pub fn default_audit_dir() -> Result<PathBuf> {
    Ok(warden_home_dir()?.join("logs"))
}
