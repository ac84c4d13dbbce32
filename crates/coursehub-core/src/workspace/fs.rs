//! Filesystem seam used by the workspace provisioner.

use std::path::Path;

use crate::error::Result;

/// Kind of an existing filesystem entry, observed without following links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// Host filesystem operations needed to provision a workspace.
///
/// Implementations must never follow a symbolic link when inspecting or
/// removing an entry.
pub trait WorkspaceFs: Send + Sync {
    /// Returns the kind of the entry at `path`, or `None` when nothing exists.
    fn entry_kind(&self, path: &Path) -> Result<Option<EntryKind>>;

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.entry_kind(path)?.is_some())
    }

    /// Creates `path` and any missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Removes a directory tree. Links inside the tree are unlinked, not
    /// traversed.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Removes a file or a symbolic link.
    fn remove_file(&self, path: &Path) -> Result<()>;

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;

    /// Creates a symbolic link at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;
}
