//! Mount value types and the workspace snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CourseHubError, Result};

/// Service label carrying the JSON-encoded [`WorkspaceSnapshot`].
pub const SNAPSHOT_LABEL: &str = "coursehub.workspace-snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Rw,
    Ro,
}

impl MountMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Ro)
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rw => f.write_str("rw"),
            Self::Ro => f.write_str("ro"),
        }
    }
}

/// Volume driver attached to a bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDriver {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// A single host-to-container bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub mode: MountMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<MountDriver>,
}

impl MountSpec {
    pub fn new(
        host_path: impl Into<PathBuf>,
        container_path: impl Into<PathBuf>,
        mode: MountMode,
    ) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode,
            driver: None,
        }
    }

    pub fn with_driver(mut self, driver: Option<MountDriver>) -> Self {
        self.driver = driver;
        self
    }
}

/// Ordered list of mounts with unique container paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MountSpec>", into = "Vec<MountSpec>")]
pub struct MountPlan {
    entries: Vec<MountSpec>,
}

impl MountPlan {
    /// Builds a plan, rejecting duplicate container paths.
    pub fn new(entries: Vec<MountSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.container_path.as_path()) {
                return Err(CourseHubError::config(format!(
                    "duplicate container path '{}' in mount plan",
                    entry.container_path.display()
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MountSpec] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MountSpec> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn host_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.host_path.as_path())
    }

    /// Mount whose container path is exactly `container_path`.
    pub fn find_container(&self, container_path: &Path) -> Option<&MountSpec> {
        self.entries
            .iter()
            .find(|e| e.container_path == container_path)
    }
}

impl TryFrom<Vec<MountSpec>> for MountPlan {
    type Error = CourseHubError;

    fn try_from(entries: Vec<MountSpec>) -> Result<Self> {
        Self::new(entries)
    }
}

impl From<MountPlan> for Vec<MountSpec> {
    fn from(plan: MountPlan) -> Self {
        plan.entries
    }
}

impl<'a> IntoIterator for &'a MountPlan {
    type Item = &'a MountSpec;
    type IntoIter = std::slice::Iter<'a, MountSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// The plan applied at a previous launch, tagged with the course and user it
/// was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub course_id: String,
    pub username: String,
    pub plan: MountPlan,
}

impl WorkspaceSnapshot {
    pub fn new(course_id: impl Into<String>, username: impl Into<String>, plan: MountPlan) -> Self {
        Self {
            course_id: course_id.into(),
            username: username.into(),
            plan,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a snapshot label value. Malformed input yields `None`, which
    /// callers treat the same as "no snapshot".
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed workspace snapshot");
                None
            }
        }
    }

    pub fn matches(&self, course_id: &str, username: &str) -> bool {
        self.course_id == course_id && self.username == username
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> MountPlan {
        MountPlan::new(vec![
            MountSpec::new("/jupyter/alice", "/jupyter/alice", MountMode::Rw),
            MountSpec::new("/etc/nslcd.conf", "/etc/nslcd.conf", MountMode::Ro),
        ])
        .unwrap()
    }

    #[test]
    fn test_duplicate_container_paths_are_rejected() {
        let err = MountPlan::new(vec![
            MountSpec::new("/a", "/target", MountMode::Rw),
            MountSpec::new("/b", "/target", MountMode::Ro),
        ])
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_snapshot_decode() {
        let snapshot = WorkspaceSnapshot::new("cs101", "alice", plan());
        let encoded = snapshot.encode().unwrap();
        assert!(encoded.contains("\"mode\":\"ro\""));
        assert_eq!(WorkspaceSnapshot::decode(&encoded), Some(snapshot));

        assert_eq!(WorkspaceSnapshot::decode("{not json"), None);
        assert_eq!(WorkspaceSnapshot::decode(""), None);
    }

    #[test]
    fn test_snapshot_with_duplicate_targets_is_malformed() {
        let raw = r#"{"course_id":"cs101","username":"alice","plan":[
            {"host_path":"/a","container_path":"/t","mode":"rw"},
            {"host_path":"/b","container_path":"/t","mode":"rw"}]}"#;
        assert_eq!(WorkspaceSnapshot::decode(raw), None);
    }
}
