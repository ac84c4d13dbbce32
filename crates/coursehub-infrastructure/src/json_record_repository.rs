//! JSON-file session record archive.

use async_trait::async_trait;
use coursehub_core::error::{CourseHubError, Result};
use coursehub_core::session::{SessionRecord, SessionRecordRepository};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::paths::CourseHubPaths;

/// Session record repository storing one JSON document per record.
///
/// Directory structure:
/// ```text
/// base_dir/
/// ├── 6f1c...-uuid-1.json
/// └── 0b2e...-uuid-2.json
/// ```
pub struct JsonSessionRecordRepository {
    base_dir: PathBuf,
}

impl JsonSessionRecordRepository {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Creates a repository at `~/.local/share/coursehub/sessions`.
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(CourseHubPaths::default_records_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(CourseHubError::io(format!(
                "invalid session id '{}'",
                session_id
            )));
        }
        Ok(self.base_dir.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl SessionRecordRepository for JsonSessionRecordRepository {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.record_path(&record.session_id)?;
        fs::create_dir_all(&self.base_dir).await?;

        let content = serde_json::to_vec_pretty(record)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &path).await?;

        tracing::debug!(
            session_id = %record.session_id,
            state = %record.state,
            "Session record archived"
        );
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.record_path(session_id)?;
        match fs::read(&path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match fs::read(&path).await {
                Ok(content) => serde_json::from_slice::<SessionRecord>(&content)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Skipping unreadable session record");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursehub_core::session::SessionState;
    use coursehub_core::workspace::{MountPlan, WorkspaceSnapshot};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_find() {
        let temp_dir = TempDir::new().unwrap();
        let repo = JsonSessionRecordRepository::new(temp_dir.path().join("sessions"));

        let mut record = SessionRecord::new("alice", "cs101", "jupyter-alice");
        record.transition(SessionState::Creating).unwrap();
        repo.save(&record).await.unwrap();

        let found = repo.find_by_id(&record.session_id).await.unwrap().unwrap();
        assert_eq!(found, record);
        assert!(repo.find_by_id("00000000-0000-0000-0000-000000000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_files() {
        let temp_dir = TempDir::new().unwrap();
        let repo = JsonSessionRecordRepository::new(temp_dir.path().to_path_buf());
        assert!(repo.list_all().await.unwrap().is_empty());

        repo.save(&SessionRecord::new("alice", "cs101", "jupyter-alice")).await.unwrap();
        repo.save(&SessionRecord::new("bob", "cs101", "jupyter-bob")).await.unwrap();
        std::fs::write(temp_dir.path().join("broken.json"), b"{").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        let mut usernames: Vec<_> = repo
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.subject_username)
            .collect();
        usernames.sort();
        assert_eq!(usernames, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_workspace_survives_archive() {
        let temp_dir = TempDir::new().unwrap();
        let repo = JsonSessionRecordRepository::new(temp_dir.path().to_path_buf());

        let mut record = SessionRecord::new("alice", "cs101", "jupyter-alice");
        record.workspace = Some(WorkspaceSnapshot::new("cs101", "alice", MountPlan::default()));
        repo.save(&record).await.unwrap();

        let found = repo.find_by_id(&record.session_id).await.unwrap().unwrap();
        assert_eq!(found.workspace, record.workspace);

        // records archived before the field existed still load
        let mut legacy = serde_json::to_value(&record).unwrap();
        legacy.as_object_mut().unwrap().remove("workspace");
        let legacy: SessionRecord = serde_json::from_value(legacy).unwrap();
        assert!(legacy.workspace.is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let temp_dir = TempDir::new().unwrap();
        let repo = JsonSessionRecordRepository::new(temp_dir.path().to_path_buf());
        assert!(repo.find_by_id("../etc/passwd").await.is_err());
    }
}
