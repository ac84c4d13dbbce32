//! In-memory collaborators for tests.
//!
//! Compiled for this crate's unit tests and, through the `testing` feature,
//! for integration tests of dependent crates.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::course::{RosterEntry, RosterGateway};
use crate::error::{CourseHubError, Result};
use crate::identity::{AttributeChange, DirectoryEntry, DirectoryService};
use crate::session::{
    ClusterOrchestratorClient, LaunchSpec, OrchestratorError, ResourceLimits, SessionRecord,
    SessionRecordRepository, TaskFilter, TaskInfo, TaskState,
};
use crate::workspace::{EntryKind, MountPlan, WorkspaceFs};

// ============================================================================
// Filesystem
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub kind: EntryKind,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub target: Option<PathBuf>,
    pub contents: Vec<u8>,
}

impl MemoryEntry {
    fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            uid: 0,
            gid: 0,
            mode: if kind == EntryKind::Directory { 0o755 } else { 0o644 },
            target: None,
            contents: Vec::new(),
        }
    }
}

/// A mutating call made through [`WorkspaceFs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    CreateDir(PathBuf),
    RemoveDirAll(PathBuf),
    RemoveFile(PathBuf),
    SetOwner(PathBuf, u32, u32),
    SetMode(PathBuf, u32),
    Symlink { target: PathBuf, link: PathBuf },
    WriteFile(PathBuf),
}

/// In-memory filesystem recording every mutating call.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceFs {
    entries: Mutex<BTreeMap<PathBuf, MemoryEntry>>,
    ops: Mutex<Vec<FsOp>>,
}

impl MemoryWorkspaceFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.entries
            .lock()
            .unwrap()
            .insert(PathBuf::from("/"), MemoryEntry::new(EntryKind::Directory));
        fs
    }

    /// Seeds a directory and its parents without recording an operation.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut entries = self.entries.lock().unwrap();
        for ancestor in path.as_ref().ancestors() {
            entries
                .entry(ancestor.to_path_buf())
                .or_insert_with(|| MemoryEntry::new(EntryKind::Directory));
        }
    }

    pub fn add_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), MemoryEntry::new(EntryKind::File));
    }

    pub fn add_symlink(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) {
        let link = link.as_ref();
        if let Some(parent) = link.parent() {
            self.add_dir(parent);
        }
        let mut entry = MemoryEntry::new(EntryKind::Symlink);
        entry.target = Some(target.as_ref().to_path_buf());
        self.entries.lock().unwrap().insert(link.to_path_buf(), entry);
    }

    /// Removes an entry and everything below it without recording.
    pub fn remove_entry(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.entries
            .lock()
            .unwrap()
            .retain(|p, _| !p.starts_with(path));
    }

    pub fn entry(&self, path: impl AsRef<Path>) -> Option<MemoryEntry> {
        self.entries.lock().unwrap().get(path.as_ref()).cloned()
    }

    pub fn ops(&self) -> Vec<FsOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    fn record(&self, op: FsOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn missing(path: &Path) -> CourseHubError {
        CourseHubError::not_found("path", path.display().to_string())
    }

    fn require_parent_dir(entries: &BTreeMap<PathBuf, MemoryEntry>, path: &Path) -> Result<()> {
        match path.parent() {
            None => Ok(()),
            Some(parent) => match entries.get(parent) {
                Some(e) if e.kind == EntryKind::Directory => Ok(()),
                Some(_) => Err(CourseHubError::io(format!(
                    "'{}' is not a directory",
                    parent.display()
                ))),
                None => Err(Self::missing(parent)),
            },
        }
    }
}

impl WorkspaceFs for MemoryWorkspaceFs {
    fn entry_kind(&self, path: &Path) -> Result<Option<EntryKind>> {
        Ok(self.entries.lock().unwrap().get(path).map(|e| e.kind))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            let ancestors: Vec<_> = path.ancestors().collect();
            for ancestor in ancestors.into_iter().rev() {
                match entries.get(ancestor) {
                    Some(e) if e.kind == EntryKind::Directory => {}
                    Some(_) => {
                        return Err(CourseHubError::io(format!(
                            "'{}' is not a directory",
                            ancestor.display()
                        )));
                    }
                    None => {
                        entries.insert(
                            ancestor.to_path_buf(),
                            MemoryEntry::new(EntryKind::Directory),
                        );
                    }
                }
            }
        }
        self.record(FsOp::CreateDir(path.to_path_buf()));
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(path) {
                Some(e) if e.kind == EntryKind::Directory => {}
                Some(_) => {
                    return Err(CourseHubError::io(format!(
                        "'{}' is not a directory",
                        path.display()
                    )));
                }
                None => return Err(Self::missing(path)),
            }
            entries.retain(|p, _| !p.starts_with(path));
        }
        self.record(FsOp::RemoveDirAll(path.to_path_buf()));
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(path) {
                Some(e) if e.kind != EntryKind::Directory => {}
                Some(_) => {
                    return Err(CourseHubError::io(format!(
                        "'{}' is a directory",
                        path.display()
                    )));
                }
                None => return Err(Self::missing(path)),
            }
            entries.remove(path);
        }
        self.record(FsOp::RemoveFile(path.to_path_buf()));
        Ok(())
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(path).ok_or_else(|| Self::missing(path))?;
            entry.uid = uid;
            entry.gid = gid;
        }
        self.record(FsOp::SetOwner(path.to_path_buf(), uid, gid));
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(path).ok_or_else(|| Self::missing(path))?;
            entry.mode = mode;
        }
        self.record(FsOp::SetMode(path.to_path_buf(), mode));
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            Self::require_parent_dir(&entries, link)?;
            if entries.contains_key(link) {
                return Err(CourseHubError::io(format!("'{}' exists", link.display())));
            }
            let mut entry = MemoryEntry::new(EntryKind::Symlink);
            entry.target = Some(target.to_path_buf());
            entries.insert(link.to_path_buf(), entry);
        }
        self.record(FsOp::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        });
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            Self::require_parent_dir(&entries, path)?;
            let entry = entries
                .entry(path.to_path_buf())
                .or_insert_with(|| MemoryEntry::new(EntryKind::File));
            if entry.kind != EntryKind::File {
                return Err(CourseHubError::io(format!(
                    "'{}' is not a regular file",
                    path.display()
                )));
            }
            entry.contents = contents.to_vec();
        }
        self.record(FsOp::WriteFile(path.to_path_buf()));
        Ok(())
    }
}

// ============================================================================
// Directory service
// ============================================================================

/// In-memory directory keyed by `uid`.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
    adds: Mutex<usize>,
    modifies: Mutex<usize>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, username: &str) -> Option<DirectoryEntry> {
        self.entries.lock().unwrap().get(username).cloned()
    }

    pub fn add_count(&self) -> usize {
        *self.adds.lock().unwrap()
    }

    pub fn modify_count(&self) -> usize {
        *self.modifies.lock().unwrap()
    }
}

impl DirectoryService for MemoryDirectory {
    fn search(&self, username: &str, _attributes: &[&str]) -> Result<Option<DirectoryEntry>> {
        Ok(self.entry(username))
    }

    fn add(
        &self,
        dn: &str,
        object_classes: &[&str],
        attributes: BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let username = attributes
            .get("uid")
            .and_then(|v| v.first())
            .cloned()
            .ok_or_else(|| CourseHubError::directory("missing uid attribute"))?;
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&username) {
            return Err(CourseHubError::directory(format!("'{}' already exists", dn)));
        }
        entries.insert(
            username,
            DirectoryEntry {
                dn: dn.to_string(),
                object_classes: object_classes.iter().map(|c| c.to_string()).collect(),
                attributes,
            },
        );
        *self.adds.lock().unwrap() += 1;
        Ok(())
    }

    fn modify(&self, dn: &str, changes: &[AttributeChange]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
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
        *self.modifies.lock().unwrap() += 1;
        Ok(())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

type ListResult = std::result::Result<Vec<TaskInfo>, OrchestratorError>;

#[derive(Debug, Default)]
struct ScriptState {
    script: VecDeque<ListResult>,
    last: Option<ListResult>,
    fallback: Vec<TaskInfo>,
    create_error: Option<OrchestratorError>,
    remove_error: Option<OrchestratorError>,
    created: Vec<String>,
    specs: Vec<LaunchSpec>,
    removed: Vec<String>,
    list_calls: usize,
}

/// Orchestrator whose desired-running task listings follow a script.
///
/// Each listing consumes one scripted entry; once the script runs out the
/// last entry repeats. Listings of all tasks return the fallback tasks.
#[derive(Debug, Default)]
pub struct ScriptedOrchestrator {
    state: Mutex<ScriptState>,
}

impl ScriptedOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts one single-task listing per state.
    pub fn script_states(&self, states: &[&str]) {
        let mut state = self.state.lock().unwrap();
        for (i, raw) in states.iter().enumerate() {
            state
                .script
                .push_back(Ok(vec![TaskInfo::new(format!("task-{}", i), TaskState::parse(raw))]));
        }
    }

    pub fn script_tasks(&self, listings: Vec<Vec<TaskInfo>>) {
        let mut state = self.state.lock().unwrap();
        state.script.extend(listings.into_iter().map(Ok));
    }

    pub fn push_list_error(&self, error: OrchestratorError) {
        self.state.lock().unwrap().script.push_back(Err(error));
    }

    pub fn set_fallback_tasks(&self, tasks: Vec<TaskInfo>) {
        self.state.lock().unwrap().fallback = tasks;
    }

    pub fn fail_create(&self, error: OrchestratorError) {
        self.state.lock().unwrap().create_error = Some(error);
    }

    pub fn fail_next_remove(&self, error: OrchestratorError) {
        self.state.lock().unwrap().remove_error = Some(error);
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }
}

#[async_trait]
impl ClusterOrchestratorClient for ScriptedOrchestrator {
    async fn create_service(&self, spec: &LaunchSpec) -> std::result::Result<String, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.create_error.take() {
            return Err(error);
        }
        state.created.push(spec.service_name.clone());
        state.specs.push(spec.clone());
        Ok(format!("id-{}", spec.service_name))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> ListResult {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        if !filter.desired_running {
            return Ok(state.fallback.clone());
        }
        if let Some(next) = state.script.pop_front() {
            state.last = Some(next);
        }
        state.last.clone().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn remove_service(&self, service: &str) -> std::result::Result<(), OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.remove_error.take() {
            return Err(error);
        }
        state.removed.push(service.to_string());
        Ok(())
    }
}

/// Minimal launch spec for `service_name`.
pub fn launch_spec(service_name: &str) -> LaunchSpec {
    LaunchSpec {
        service_name: service_name.to_string(),
        image: "jupyter/scipy-notebook:latest".to_string(),
        resources: ResourceLimits::default(),
        env: BTreeMap::new(),
        args: Vec::new(),
        networks: Vec::new(),
        placement_constraints: Vec::new(),
        mounts: MountPlan::default(),
        labels: BTreeMap::new(),
        user: None,
    }
}

// ============================================================================
// Roster and record archive
// ============================================================================

/// Roster gateway returning fixed learners per course.
#[derive(Debug, Default)]
pub struct StaticRoster {
    courses: Mutex<HashMap<String, Vec<RosterEntry>>>,
    calls: Mutex<usize>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, course_id: &str, learners: Vec<RosterEntry>) {
        self.courses
            .lock()
            .unwrap()
            .insert(course_id.to_string(), learners);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl RosterGateway for StaticRoster {
    async fn fetch_active_learners(&self, course_id: &str) -> Result<Vec<RosterEntry>> {
        *self.calls.lock().unwrap() += 1;
        Ok(self
            .courses
            .lock()
            .unwrap()
            .get(course_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordRepository {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRecordRepository for MemoryRecordRepository {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.lock().unwrap().get(session_id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}
