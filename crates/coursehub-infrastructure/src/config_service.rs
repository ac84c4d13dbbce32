//! Configuration loading with an in-process cache.

use coursehub_core::config::HubConfig;
use coursehub_core::error::{CourseHubError, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::paths::CourseHubPaths;

/// Loads and validates the hub configuration.
///
/// The file is read once; later calls return the cached copy until
/// [`ConfigService::invalidate_cache`] is called.
#[derive(Clone)]
pub struct ConfigService {
    path: PathBuf,
    config: Arc<RwLock<Option<HubConfig>>>,
}

impl ConfigService {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            config: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates a service for `explicit`, `$COURSEHUB_CONFIG` or the default
    /// location, in that order.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Ok(Self::new(CourseHubPaths::resolve_config_file(explicit)?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the configuration, loading it from file if not cached.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the file is missing, unparsable or
    /// fails validation. Nothing is cached in that case.
    pub fn get_config(&self) -> Result<HubConfig> {
        {
            let cached = self.config.read().unwrap_or_else(|e| e.into_inner());
            if let Some(config) = cached.as_ref() {
                return Ok(config.clone());
            }
        }

        let loaded = self.load()?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Some(loaded.clone());
        Ok(loaded)
    }

    /// Invalidates the cache, forcing a reload on next access.
    pub fn invalidate_cache(&self) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn load(&self) -> Result<HubConfig> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            CourseHubError::config(format!(
                "cannot read configuration {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let config = HubConfig::from_toml_str(&content).map_err(|e| match e {
            CourseHubError::Config(_) => e,
            other => CourseHubError::config(format!(
                "invalid configuration {}: {}",
                self.path.display(),
                other
            )),
        })?;
        tracing::info!(path = %self.path.display(), "Configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[accounts]
instructor_gid = 2000
learner_gid = 3000
"#;

    #[test]
    fn test_loads_and_caches() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let service = ConfigService::new(path.clone());
        let first = service.get_config().unwrap();
        assert_eq!(first.accounts.instructor_gid, 2000);

        std::fs::write(&path, MINIMAL.replace("2000", "2100")).unwrap();
        assert_eq!(service.get_config().unwrap().accounts.instructor_gid, 2000);

        service.invalidate_cache();
        assert_eq!(service.get_config().unwrap().accounts.instructor_gid, 2100);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let service = ConfigService::new(temp_dir.path().join("absent.toml"));
        assert!(service.get_config().unwrap_err().is_config());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[accounts\n").unwrap();
        let err = ConfigService::new(path.clone()).get_config().unwrap_err();
        assert!(err.is_config());

        std::fs::write(&path, "[accounts]\ninstructor_gid = 2000\n").unwrap();
        assert!(ConfigService::new(path).get_config().unwrap_err().is_config());
    }
}
