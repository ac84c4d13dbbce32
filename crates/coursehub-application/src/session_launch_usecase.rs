//! Session launch use case.
//!
//! Coordinates the identity reconciler, the workspace provisioner and the
//! lifecycle controller for one session request, in that order, and keeps
//! the live sessions of the hub process.

use coursehub_core::config::OrchestratorSettings;
use coursehub_core::course::{CourseContext, RosterGateway};
use coursehub_core::error::{CourseHubError, Result};
use coursehub_core::identity::{IdentityReconciler, Role, Subject};
use coursehub_core::session::{
    ClusterOrchestratorClient, SessionLifecycleController, SessionRecord,
    SessionRecordRepository, SessionState, build_launch_spec,
};
use coursehub_core::workspace::{MountPlan, WorkspaceProvisioner, WorkspaceSnapshot};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::keyed_lock::KeyedLocks;

/// A request to start (or reuse) the session of one subject in one course.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub username: String,
    pub role: Role,
    pub course_id: String,
    /// Upstream platform id, used only when a directory record is created.
    pub platform_subject_id: Option<u32>,
    /// Overrides `orchestrator.launch_timeout_secs`.
    pub timeout: Option<Duration>,
}

impl LaunchRequest {
    pub fn new(username: impl Into<String>, role: Role, course_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role,
            course_id: course_id.into(),
            platform_subject_id: None,
            timeout: None,
        }
    }

    pub fn with_subject_id(mut self, id: Option<u32>) -> Self {
        self.platform_subject_id = id;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A session tracked by this process.
struct LiveSession {
    controller: Mutex<SessionLifecycleController>,
    updates: watch::Receiver<SessionRecord>,
    cancel: CancellationToken,
}

impl LiveSession {
    fn new(controller: SessionLifecycleController) -> Arc<Self> {
        Arc::new(Self {
            updates: controller.subscribe(),
            controller: Mutex::new(controller),
            cancel: CancellationToken::new(),
        })
    }

    fn record(&self) -> SessionRecord {
        self.updates.borrow().clone()
    }
}

/// Use case for launching and tearing down course sessions.
///
/// # Concurrency
///
/// - Launches for one username are serialized; different users run fully
///   in parallel.
/// - Workspace provisioning is additionally serialized per (user, course).
/// - Directory and filesystem work runs on a bounded blocking pool.
/// - A launch in progress can be interrupted by [`teardown`](Self::teardown)
///   or by its deadline, both through the session's cancellation token.
pub struct SessionLaunchUseCase {
    reconciler: Arc<IdentityReconciler>,
    provisioner: Arc<WorkspaceProvisioner>,
    orchestrator: Arc<dyn ClusterOrchestratorClient>,
    roster: Option<Arc<dyn RosterGateway>>,
    records: Arc<dyn SessionRecordRepository>,
    settings: OrchestratorSettings,
    workers: Arc<Semaphore>,
    user_locks: KeyedLocks,
    workspace_locks: KeyedLocks,
    /// Live sessions by username.
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl SessionLaunchUseCase {
    /// Creates a new `SessionLaunchUseCase`.
    ///
    /// # Arguments
    ///
    /// * `reconciler` - Directory record reconciliation
    /// * `provisioner` - Workspace provisioning on the host filesystem
    /// * `orchestrator` - Cluster orchestrator client
    /// * `records` - Archive of session records
    /// * `settings` - Orchestrator settings (image, limits, timeouts)
    /// * `workers` - Size of the blocking worker pool (at least one)
    pub fn new(
        reconciler: Arc<IdentityReconciler>,
        provisioner: Arc<WorkspaceProvisioner>,
        orchestrator: Arc<dyn ClusterOrchestratorClient>,
        records: Arc<dyn SessionRecordRepository>,
        settings: OrchestratorSettings,
        workers: usize,
    ) -> Self {
        Self {
            reconciler,
            provisioner,
            orchestrator,
            roster: None,
            records,
            settings,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            user_locks: KeyedLocks::new(),
            workspace_locks: KeyedLocks::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the roster gateway used for instructor sessions.
    pub fn with_roster(mut self, roster: Arc<dyn RosterGateway>) -> Self {
        self.roster = Some(roster);
        self
    }

    /// Launches the session for `request` and waits until it runs.
    ///
    /// A session already running for the same course is returned as-is. A
    /// running session of another course is torn down first. A previous
    /// `Failed` or `Removed` session is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// - `Config` / `Directory` / `Consistency` from identity or workspace
    ///   reconciliation; nothing is created in the cluster in that case
    /// - `LaunchFailed`, `Orchestrator`, `Consistency` from the lifecycle;
    ///   the service has already been removed
    /// - `Cancelled` when the deadline passed or a teardown interrupted the
    ///   launch
    pub async fn launch(&self, request: LaunchRequest) -> Result<SessionRecord> {
        let course = CourseContext::new(request.course_id.clone(), request.role)?;
        let username = request.username.clone();
        let _user_guard = self.user_locks.lock(&username).await;

        let mut previous = None;
        if let Some(existing) = self.session_for(&username).await? {
            let record = existing.record();
            match record.state {
                SessionState::Running if record.course_id == course.course_id => {
                    tracing::info!(
                        username = %username,
                        course = %course.course_id,
                        service = %record.service_name,
                        "Session already running"
                    );
                    return Ok(record);
                }
                state if state.is_terminal() => {
                    tracing::debug!(
                        username = %username,
                        previous = %record.state,
                        "Starting over from a fresh session"
                    );
                    previous = Some(record);
                }
                _ => {
                    tracing::info!(
                        username = %username,
                        from_course = %record.course_id,
                        to_course = %course.course_id,
                        state = %record.state,
                        "Replacing existing session"
                    );
                    previous = Some(self.finish(&username, &existing).await?);
                }
            }
        }

        let subject = {
            let reconciler = self.reconciler.clone();
            let username = username.clone();
            let (role, subject_id) = (request.role, request.platform_subject_id);
            self.run_blocking(move || reconciler.resolve(&username, role, subject_id))
                .await?
        };

        let course = match (&self.roster, subject.role) {
            (Some(roster), Role::Instructor) => {
                let learners = roster.fetch_active_learners(&course.course_id).await?;
                tracing::debug!(
                    course = %course.course_id,
                    learners = learners.len(),
                    "Roster loaded for instructor session"
                );
                course.with_roster(learners)
            }
            _ => course,
        };

        let previous_workspace = previous.as_ref().and_then(|p| p.workspace.clone());
        let snapshot = self
            .provision(&subject, &course, previous_workspace.as_ref())
            .await?;
        let spec = build_launch_spec(&self.settings, &subject, &course, &snapshot)?;

        let mut record = match previous.filter(|p| p.state.is_terminal()) {
            Some(previous) => previous.restart(course.course_id.as_str(), spec.service_name.as_str())?,
            None => SessionRecord::new(&username, &course.course_id, &spec.service_name),
        };
        record.workspace = Some(snapshot);
        let live = LiveSession::new(SessionLifecycleController::new(
            self.orchestrator.clone(),
            record,
            self.settings.poll_unit(),
        ));
        self.sessions
            .write()
            .await
            .insert(username.clone(), live.clone());

        let timeout = request.timeout.or_else(|| self.settings.launch_timeout());
        let timed_out = Arc::new(AtomicBool::new(false));
        let deadline = timeout.map(|limit| {
            let cancel = live.cancel.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });

        let outcome = {
            let mut controller = live.controller.lock().await;
            controller.launch(&spec, &live.cancel).await
        };
        if let Some(handle) = deadline {
            handle.abort();
        }
        let timed_out = timed_out.load(Ordering::SeqCst);

        let record = live.record();
        self.archive(&record).await;

        match outcome {
            Ok(()) => Ok(record),
            Err(e) if timed_out && e.is_cancelled() => {
                let limit = timeout.unwrap_or_default();
                Err(CourseHubError::Cancelled(format!(
                    "session '{}' not ready after {}s (last status: {})",
                    record.service_name,
                    limit.as_secs_f64(),
                    record.last_status.as_deref().unwrap_or("none")
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Tears down the session of `username`. Idempotent.
    ///
    /// A launch in progress is cancelled first.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(record))`: Final record of the session
    /// - `Ok(None)`: No session is known for `username`
    pub async fn teardown(&self, username: &str) -> Result<Option<SessionRecord>> {
        match self.session_for(username).await? {
            Some(live) => self.finish(username, &live).await.map(Some),
            None => Ok(None),
        }
    }

    /// Tears down every live session concurrently.
    pub async fn teardown_all(&self) -> Vec<(String, Result<Option<SessionRecord>>)> {
        let usernames: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let results = join_all(usernames.iter().map(|username| self.teardown(username))).await;
        usernames.into_iter().zip(results).collect()
    }

    /// Health check of the session of `username`.
    ///
    /// Returns `None` when the session runs normally, otherwise a status
    /// string. A session whose launch is still in progress reports its
    /// current state.
    pub async fn poll(&self, username: &str) -> Result<Option<String>> {
        let live = self
            .session_for(username)
            .await?
            .ok_or_else(|| CourseHubError::not_found("session", username))?;

        let status = match live.controller.try_lock() {
            Ok(mut controller) => controller.poll().await?,
            Err(_) => Some(format!("session is {}", live.record().state)),
        };
        Ok(status)
    }

    /// Current record of `username`: the live session, or the most recent
    /// archived record.
    pub async fn status(&self, username: &str) -> Result<Option<SessionRecord>> {
        if let Some(live) = self.sessions.read().await.get(username) {
            return Ok(Some(live.record()));
        }
        self.latest_archived(username).await
    }

    /// Live records followed by archived ones, oldest first.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self
            .sessions
            .read()
            .await
            .values()
            .map(|live| live.record())
            .collect();
        for archived in self.records.list_all().await? {
            if !records.iter().any(|r| r.session_id == archived.session_id) {
                records.push(archived);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Mount plan a launch of `request` would use. Writes nothing.
    pub async fn plan(&self, request: &LaunchRequest) -> Result<MountPlan> {
        let course = CourseContext::new(request.course_id.clone(), request.role)?;
        let subject: Subject = {
            let reconciler = self.reconciler.clone();
            let username = request.username.clone();
            let (role, subject_id) = (request.role, request.platform_subject_id);
            self.run_blocking(move || reconciler.preview(&username, role, subject_id))
                .await?
        };
        self.provisioner.planner().plan(&subject, &course)
    }

    async fn provision(
        &self,
        subject: &Subject,
        course: &CourseContext,
        previous: Option<&WorkspaceSnapshot>,
    ) -> Result<WorkspaceSnapshot> {
        let key = format!("{}\n{}", subject.username, course.course_id);
        let _workspace_guard = self.workspace_locks.lock(&key).await;

        let previous = previous.cloned();
        let reconciliation = {
            let provisioner = self.provisioner.clone();
            let (subject, course) = (subject.clone(), course.clone());
            self.run_blocking(move || provisioner.reconcile(&subject, &course, previous.as_ref()))
                .await?
        };

        let snapshot = reconciliation.snapshot(subject, course);
        tracing::info!(
            username = %subject.username,
            course = %course.course_id,
            changed = reconciliation.changed,
            mounts = snapshot.plan.len(),
            "Workspace reconciled"
        );
        Ok(snapshot)
    }

    /// Cancels, tears down and archives `live`, then forgets it.
    async fn finish(&self, username: &str, live: &Arc<LiveSession>) -> Result<SessionRecord> {
        live.cancel.cancel();
        let record = {
            let mut controller = live.controller.lock().await;
            controller.teardown().await?;
            controller.record().clone()
        };
        self.archive(&record).await;

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(username)
            .is_some_and(|current| Arc::ptr_eq(current, live))
        {
            sessions.remove(username);
        }
        Ok(record)
    }

    /// Live session of `username`, adopting the latest archived record when
    /// this process does not track one.
    async fn session_for(&self, username: &str) -> Result<Option<Arc<LiveSession>>> {
        if let Some(live) = self.sessions.read().await.get(username) {
            return Ok(Some(live.clone()));
        }

        let Some(record) = self.latest_archived(username).await? else {
            return Ok(None);
        };
        tracing::debug!(
            username = %username,
            session_id = %record.session_id,
            state = %record.state,
            "Adopting archived session"
        );
        let live = LiveSession::new(SessionLifecycleController::new(
            self.orchestrator.clone(),
            record,
            self.settings.poll_unit(),
        ));
        let mut sessions = self.sessions.write().await;
        Ok(Some(
            sessions
                .entry(username.to_string())
                .or_insert(live)
                .clone(),
        ))
    }

    async fn latest_archived(&self, username: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .records
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.subject_username == username)
            .max_by_key(|r| r.created_at))
    }

    async fn archive(&self, record: &SessionRecord) {
        if let Err(e) = self.records.save(record).await {
            tracing::warn!(
                session_id = %record.session_id,
                error = %e,
                "Failed to archive session record"
            );
        }
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CourseHubError::internal("worker pool closed"))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| CourseHubError::internal(format!("blocking task failed: {}", e)))?
    }
}
