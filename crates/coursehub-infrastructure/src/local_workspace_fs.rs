//! Host filesystem adapter for the workspace provisioner.

use coursehub_core::error::{CourseHubError, Result};
use coursehub_core::workspace::{EntryKind, WorkspaceFs};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// [`WorkspaceFs`] over the local (or network-mounted) host filesystem.
///
/// Ownership changes use `lchown`, so a link planted inside a workspace is
/// never followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWorkspaceFs;

impl LocalWorkspaceFs {
    pub fn new() -> Self {
        Self
    }
}

fn with_path(op: &str, path: &Path, err: io::Error) -> CourseHubError {
    CourseHubError::io(format!("{} {}: {}", op, path.display(), err))
}

impl WorkspaceFs for LocalWorkspaceFs {
    fn entry_kind(&self, path: &Path) -> Result<Option<EntryKind>> {
        match fs::symlink_metadata(path) {
            Ok(metadata) => {
                let file_type = metadata.file_type();
                let kind = if file_type.is_symlink() {
                    EntryKind::Symlink
                } else if file_type.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                Ok(Some(kind))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(with_path("inspect", path, err)),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| with_path("create", path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        // std::fs::remove_dir_all unlinks symlinks instead of descending.
        fs::remove_dir_all(path).map_err(|e| with_path("remove", path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| with_path("remove", path, e))
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
            .map_err(|e| with_path("chown", path, e))
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| with_path("chmod", path, e))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link).map_err(|e| with_path("link", link, e))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).map_err(|e| with_path("write", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_entry_kinds_do_not_follow_links() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalWorkspaceFs::new();
        let dir = temp_dir.path().join("dir");
        let file = temp_dir.path().join("file");
        let link = temp_dir.path().join("link");

        fs.create_dir_all(&dir).unwrap();
        fs.write_file(&file, b"x").unwrap();
        fs.symlink(&dir, &link).unwrap();

        assert_eq!(fs.entry_kind(&dir).unwrap(), Some(EntryKind::Directory));
        assert_eq!(fs.entry_kind(&file).unwrap(), Some(EntryKind::File));
        assert_eq!(fs.entry_kind(&link).unwrap(), Some(EntryKind::Symlink));
        assert_eq!(fs.entry_kind(&temp_dir.path().join("none")).unwrap(), None);
    }

    #[test]
    fn test_remove_dir_all_keeps_link_target() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalWorkspaceFs::new();
        let outside = temp_dir.path().join("outside");
        let tree = temp_dir.path().join("tree");
        fs.create_dir_all(&outside).unwrap();
        fs.write_file(&outside.join("keep"), b"keep").unwrap();
        fs.create_dir_all(&tree).unwrap();
        fs.symlink(&outside, &tree.join("escape")).unwrap();

        fs.remove_dir_all(&tree).unwrap();

        assert!(!fs.exists(&tree).unwrap());
        assert!(fs.exists(&outside.join("keep")).unwrap());
    }

    #[test]
    fn test_mode_and_owner() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalWorkspaceFs::new();
        let dir = temp_dir.path().join("shared");
        fs.create_dir_all(&dir).unwrap();

        fs.set_mode(&dir, 0o733).unwrap();
        let metadata = std::fs::metadata(&dir).unwrap();
        assert_eq!(metadata.mode() & 0o7777, 0o733);

        // Re-owning to the current owner needs no privileges.
        fs.set_owner(&dir, metadata.uid(), metadata.gid()).unwrap();
    }

    #[test]
    fn test_errors_carry_the_path() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalWorkspaceFs::new();
        let missing = temp_dir.path().join("missing");
        let err = fs.set_mode(&missing, 0o755).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
