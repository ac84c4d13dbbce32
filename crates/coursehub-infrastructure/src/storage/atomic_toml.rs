//! Atomic TOML file with exclusive locking.
//!
//! Writers take an `fs2` lock on a sibling `.lock` file, write a temporary
//! file, fsync it and rename it over the target, so readers never observe a
//! partial document.

use coursehub_core::error::{CourseHubError, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub struct AtomicTomlFile<T> {
    path: PathBuf,
    _phantom: PhantomData<T>,
}

impl<T> AtomicTomlFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _phantom: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(T))`: Loaded and parsed
    /// - `Ok(None)`: File missing or empty
    /// - `Err`: Read or parse failure
    pub fn load(&self) -> Result<Option<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(toml::from_str(&content)?))
    }

    /// Reads the document under a shared lock.
    pub fn read(&self) -> Result<Option<T>> {
        let _lock = FileLock::shared(&self.path)?;
        self.load()
    }

    /// Loads, mutates and atomically rewrites the document under an
    /// exclusive lock. Nothing is written when `f` fails.
    pub fn update<F, R>(&self, default_value: T, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let _lock = FileLock::exclusive(&self.path)?;
        let mut data = self.load()?.unwrap_or(default_value);
        let result = f(&mut data)?;
        self.save(&data)?;
        Ok(result)
    }

    fn save(&self, data: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(data)?;
        let tmp_path = self.temp_path()?;
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(content.as_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn temp_path(&self) -> Result<PathBuf> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| CourseHubError::io("store path has no parent directory"))?;
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| CourseHubError::io("store path has no file name"))?;
        Ok(parent.join(format!(".{}.tmp", file_name.to_string_lossy())))
    }
}

/// Lock guard; the lock is released when the file handle drops.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn open(path: &Path) -> Result<File> {
        let lock_path = path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?)
    }

    fn exclusive(path: &Path) -> Result<Self> {
        use fs2::FileExt;
        let file = Self::open(path)?;
        file.lock_exclusive()
            .map_err(|e| CourseHubError::io(format!("failed to lock {}: {}", path.display(), e)))?;
        Ok(Self { _file: file })
    }

    fn shared(path: &Path) -> Result<Self> {
        use fs2::FileExt;
        let file = Self::open(path)?;
        file.lock_shared()
            .map_err(|e| CourseHubError::io(format!("failed to lock {}: {}", path.display(), e)))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = AtomicTomlFile::<Counter>::new(temp_dir.path().join("missing.toml"));
        assert!(file.read().unwrap().is_none());
    }

    #[test]
    fn test_update_persists_and_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("counter.toml");
        let file = AtomicTomlFile::<Counter>::new(path.clone());

        let after = file
            .update(Counter::default(), |c| {
                c.count += 10;
                Ok(c.count)
            })
            .unwrap();
        assert_eq!(after, 10);
        file.update(Counter::default(), |c| {
            c.count += 5;
            Ok(())
        })
        .unwrap();

        assert_eq!(file.read().unwrap(), Some(Counter { count: 15 }));
        assert!(!temp_dir.path().join(".counter.toml.tmp").exists());
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("counter.toml");
        let file = AtomicTomlFile::<Counter>::new(path.clone());

        let result: Result<()> = file.update(Counter::default(), |c| {
            c.count = 99;
            Err(CourseHubError::internal("rejected"))
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
