//! Default locations of coursehub files.
//!
//! ```text
//! ~/.config/coursehub/           # Config directory
//! ├── config.toml                # Hub configuration
//! └── directory.toml             # File-backed directory store
//!
//! ~/.local/share/coursehub/      # Data directory
//! ├── sessions/                  # Archived session records
//! └── logs/                      # Rolling log files
//! ```

use coursehub_core::error::{CourseHubError, Result};
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURSEHUB_CONFIG";

const APP_DIR: &str = "coursehub";

pub struct CourseHubPaths;

impl CourseHubPaths {
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| CourseHubError::config("cannot determine the configuration directory"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| CourseHubError::config("cannot determine the data directory"))
    }

    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn default_directory_store() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("directory.toml"))
    }

    pub fn default_records_dir() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("sessions"))
    }

    /// Resolves the configuration file: `explicit`, then `$COURSEHUB_CONFIG`,
    /// then the default location.
    pub fn resolve_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
            _ => Self::default_config_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = CourseHubPaths::resolve_config_file(Some(Path::new("/etc/coursehub.toml")))
            .unwrap();
        assert_eq!(path, PathBuf::from("/etc/coursehub.toml"));
    }

    #[test]
    fn test_default_locations_share_app_dir() {
        if let Ok(config) = CourseHubPaths::default_config_file() {
            assert!(config.ends_with("coursehub/config.toml"));
        }
        if let Ok(records) = CourseHubPaths::default_records_dir() {
            assert!(records.ends_with("coursehub/sessions"));
        }
    }
}
