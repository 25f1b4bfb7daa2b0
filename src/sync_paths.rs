//! Home-based storage paths for promptr-sync diagnostics.
//!
//! Everything lives under `~/.promptr-sync/` (or `$PROMPTR_SYNC_HOME`):
//! - `config.yaml` - Optional user configuration
//! - `logs/debug.log` - tracing output
//! - `logs/<session-id>/events.jsonl` - Structured event log per run

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the promptr-sync directory under the user's home.
const PROMPTR_SYNC_DIR: &str = ".promptr-sync";

/// Environment variable that relocates the home directory (used by tests).
pub const HOME_ENV: &str = "PROMPTR_SYNC_HOME";

/// Returns the promptr-sync home directory, creating it if needed.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn sync_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => dirs::home_dir()
            .context("Could not determine home directory")?
            .join(PROMPTR_SYNC_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default user config path: `~/.promptr-sync/config.yaml`
///
/// The file itself is optional and not created here.
pub fn config_path() -> Result<PathBuf> {
    Ok(sync_home_dir()?.join("config.yaml"))
}

/// Returns the logs directory: `~/.promptr-sync/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    let dir = sync_home_dir()?.join("logs");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the debug log path: `~/.promptr-sync/logs/debug.log`
pub fn debug_log_path() -> Result<PathBuf> {
    Ok(logs_dir()?.join("debug.log"))
}

/// Returns the per-session structured log directory: `~/.promptr-sync/logs/<session-id>/`
pub fn session_logs_dir(session_id: &str) -> Result<PathBuf> {
    let dir = logs_dir()?.join(session_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create session log dir: {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_home_override_is_respected() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_var(HOME_ENV, temp_dir.path());

        let home = sync_home_dir().unwrap();
        let debug_log = debug_log_path().unwrap();
        let session_dir = session_logs_dir("abc").unwrap();

        std::env::remove_var(HOME_ENV);

        assert_eq!(home, temp_dir.path());
        assert_eq!(debug_log, temp_dir.path().join("logs").join("debug.log"));
        assert!(session_dir.is_dir());
        assert!(session_dir.ends_with("logs/abc"));
    }

    #[test]
    #[serial]
    fn test_config_path_is_not_created() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_var(HOME_ENV, temp_dir.path());

        let path = config_path().unwrap();

        std::env::remove_var(HOME_ENV);

        assert_eq!(path, temp_dir.path().join("config.yaml"));
        assert!(!path.exists());
    }
}
