//! Centralized home-based storage paths for all forge-console persistence.
//!
//! This module provides helpers for unified storage under `~/.forge-console/`:
//! - `sessions/<session-id>/` - Per-session artifacts
//! - `sessions/<session-id>/logs/` - Structured event logs for a session
//! - `config.yaml` - Console configuration

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the forge console directory.
const FORGE_CONSOLE_DIR: &str = ".forge-console";

/// Returns the home-based console directory: `~/.forge-console/`
///
/// Creates the directory if it doesn't exist.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn console_home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory for console storage")?;
    let console_dir = home.join(FORGE_CONSOLE_DIR);
    fs::create_dir_all(&console_dir).with_context(|| {
        format!(
            "Failed to create console directory: {}",
            console_dir.display()
        )
    })?;
    Ok(console_dir)
}

/// Returns the sessions directory: `~/.forge-console/sessions/`
///
/// Creates the directory if it doesn't exist.
pub fn sessions_dir() -> Result<PathBuf> {
    let dir = console_home_dir()?.join("sessions");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create sessions directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the directory for a single session: `~/.forge-console/sessions/<session-id>/`
///
/// Creates the directory if it doesn't exist.
pub fn session_dir(session_id: &str) -> Result<PathBuf> {
    let dir = sessions_dir()?.join(session_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the logs directory for a session: `~/.forge-console/sessions/<session-id>/logs/`
///
/// Creates the directory if it doesn't exist.
pub fn session_logs_dir(session_id: &str) -> Result<PathBuf> {
    let dir = session_dir(session_id)?.join("logs");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create session logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default config path: `~/.forge-console/config.yaml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(console_home_dir()?.join("config.yaml"))
}
