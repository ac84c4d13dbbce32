//! File-backed directory service.
//!
//! Stores one record per username in a single TOML document:
//!
//! ```toml
//! [entries.alice]
//! dn = "uid=alice,ou=People,dc=example,dc=com"
//! object_classes = ["posixAccount", "inetOrgPerson"]
//!
//! [entries.alice.attributes]
//! uidNumber = ["20005"]
//! ```

use coursehub_core::error::{CourseHubError, Result};
use coursehub_core::identity::{AttributeChange, DirectoryEntry, DirectoryService};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::paths::CourseHubPaths;
use crate::storage::AtomicTomlFile;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryStore {
    #[serde(default)]
    entries: BTreeMap<String, DirectoryEntry>,
}

/// [`DirectoryService`] over an [`AtomicTomlFile`].
///
/// Every mutation runs under an exclusive file lock, so several hub
/// processes may share the store.
pub struct TomlDirectoryService {
    file: AtomicTomlFile<DirectoryStore>,
}

impl TomlDirectoryService {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: AtomicTomlFile::new(path),
        }
    }

    /// Opens the store at `~/.config/coursehub/directory.toml`.
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(CourseHubPaths::default_directory_store()?))
    }

    fn username_of(attributes: &BTreeMap<String, Vec<String>>) -> Result<String> {
        attributes
            .get("uid")
            .and_then(|values| values.first())
            .filter(|uid| !uid.is_empty())
            .cloned()
            .ok_or_else(|| CourseHubError::directory("record has no uid attribute"))
    }
}

impl DirectoryService for TomlDirectoryService {
    fn search(&self, username: &str, attributes: &[&str]) -> Result<Option<DirectoryEntry>> {
        let store = self.file.read()?.unwrap_or_default();
        Ok(store.entries.get(username).map(|entry| {
            if attributes.is_empty() {
                return entry.clone();
            }
            DirectoryEntry {
                dn: entry.dn.clone(),
                object_classes: entry.object_classes.clone(),
                attributes: entry
                    .attributes
                    .iter()
                    .filter(|(name, _)| attributes.contains(&name.as_str()))
                    .map(|(name, values)| (name.clone(), values.clone()))
                    .collect(),
            }
        }))
    }

    fn add(
        &self,
        dn: &str,
        object_classes: &[&str],
        attributes: BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let username = Self::username_of(&attributes)?;
        self.file.update(DirectoryStore::default(), |store| {
            if store.entries.contains_key(&username) || store.entries.values().any(|e| e.dn == dn) {
                return Err(CourseHubError::directory(format!(
                    "entry '{}' already exists",
                    dn
                )));
            }
            store.entries.insert(
                username.clone(),
                DirectoryEntry {
                    dn: dn.to_string(),
                    object_classes: object_classes.iter().map(|c| c.to_string()).collect(),
                    attributes,
                },
            );
            Ok(())
        })?;
        tracing::debug!(dn = %dn, "Directory entry added");
        Ok(())
    }

    fn modify(&self, dn: &str, changes: &[AttributeChange]) -> Result<()> {
        self.file.update(DirectoryStore::default(), |store| {
            let entry = store
                .entries
                .values_mut()
                .find(|e| e.dn == dn)
                .ok_or_else(|| CourseHubError::not_found("directory record", dn))?;
            for change in changes {
                match change {
                    AttributeChange::Replace { attribute, values } => {
                        entry.attributes.insert(attribute.clone(), values.clone());
                    }
                    AttributeChange::Delete { attribute } => {
                        entry.attributes.remove(attribute);
                    }
                }
            }
            Ok(())
        })?;
        tracing::debug!(dn = %dn, changes = changes.len(), "Directory entry modified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attributes(username: &str, uid: &str) -> BTreeMap<String, Vec<String>> {
        let mut attributes = BTreeMap::new();
        attributes.insert("uid".to_string(), vec![username.to_string()]);
        attributes.insert("uidNumber".to_string(), vec![uid.to_string()]);
        attributes.insert("gidNumber".to_string(), vec!["3000".to_string()]);
        attributes
    }

    #[test]
    fn test_add_search_modify() {
        let temp_dir = TempDir::new().unwrap();
        let service = TomlDirectoryService::new(temp_dir.path().join("directory.toml"));
        let dn = "uid=alice,ou=People,dc=example,dc=com";

        assert!(service.search("alice", &[]).unwrap().is_none());

        service
            .add(dn, &["posixAccount", "inetOrgPerson"], attributes("alice", "20005"))
            .unwrap();

        let found = service.search("alice", &["uidNumber"]).unwrap().unwrap();
        assert_eq!(found.dn, dn);
        assert_eq!(found.first("uidNumber"), Some("20005"));
        assert_eq!(found.first("gidNumber"), None);

        service
            .modify(dn, &[AttributeChange::replace("gidNumber", "2000")])
            .unwrap();
        let reopened = TomlDirectoryService::new(temp_dir.path().join("directory.toml"));
        assert_eq!(
            reopened.search("alice", &[]).unwrap().unwrap().first("gidNumber"),
            Some("2000")
        );
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let service = TomlDirectoryService::new(temp_dir.path().join("directory.toml"));
        let dn = "uid=alice,ou=People,dc=example,dc=com";

        service.add(dn, &["posixAccount"], attributes("alice", "1")).unwrap();
        let err = service
            .add(dn, &["posixAccount"], attributes("alice", "2"))
            .unwrap_err();
        assert!(matches!(err, CourseHubError::Directory(_)));
    }

    #[test]
    fn test_modify_missing_record_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let service = TomlDirectoryService::new(temp_dir.path().join("directory.toml"));
        let err = service
            .modify("uid=nobody,dc=example", &[AttributeChange::replace("gidNumber", "1")])
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
