//! Session lifecycle controller.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::backoff::ReadinessBackoff;
use super::model::{SessionRecord, SessionState};
use super::orchestrator::{ClusterOrchestratorClient, LaunchSpec, OrchestratorError, TaskFilter, TaskInfo};
use crate::error::{CourseHubError, Result};

/// Result of locating the task backing a service.
#[derive(Debug)]
enum TaskLookup {
    Found(TaskInfo),
    /// The service exists but no task has been scheduled yet.
    NoTask,
    /// More than one task wants to run for a single-replica service.
    Duplicate(usize),
}

/// Drives one orchestrator service through its lifecycle.
///
/// The readiness loop has no iteration ceiling; callers bound it through the
/// cancellation token passed to [`launch`](Self::launch).
pub struct SessionLifecycleController {
    client: Arc<dyn ClusterOrchestratorClient>,
    record: SessionRecord,
    poll_unit: Duration,
    updates: watch::Sender<SessionRecord>,
}

impl SessionLifecycleController {
    /// Creates a controller for `record`.
    ///
    /// # Arguments
    ///
    /// * `client` - Orchestrator client
    /// * `record` - Session record; normally fresh in `Requested`
    /// * `poll_unit` - Length of one backoff time-unit
    pub fn new(
        client: Arc<dyn ClusterOrchestratorClient>,
        record: SessionRecord,
        poll_unit: Duration,
    ) -> Self {
        let (updates, _) = watch::channel(record.clone());
        Self {
            client,
            record,
            poll_unit,
            updates,
        }
    }

    /// Returns a receiver that observes every published change of the record,
    /// including those made while a launch is in progress.
    pub fn subscribe(&self) -> watch::Receiver<SessionRecord> {
        self.updates.subscribe()
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn state(&self) -> SessionState {
        self.record.state
    }

    /// Creates the service and waits until its task runs.
    ///
    /// A `Running` session is left untouched. Any failure moves the session to
    /// `Failed`, removes the service and returns the error with the last
    /// observed task status.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` when the session is not `Requested`
    /// - `Orchestrator` for API errors other than "not found"
    /// - `LaunchFailed` when the task ends in a non-running state or the
    ///   service disappears
    /// - `Consistency` when several tasks run for the service
    /// - `Cancelled` when `cancel` fires first
    pub async fn launch(&mut self, spec: &LaunchSpec, cancel: &CancellationToken) -> Result<()> {
        if self.record.state == SessionState::Running {
            return Ok(());
        }
        self.record.service_name = spec.service_name.clone();
        self.transition(SessionState::Creating)?;

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.abort_cancelled().await,
            result = self.client.create_service(spec) => result,
        };
        match created {
            Ok(service_id) => {
                tracing::info!(
                    service = %spec.service_name,
                    service_id = %service_id,
                    "Service created"
                );
                self.record.service_id = Some(service_id);
                self.transition(SessionState::AwaitingReadiness)?;
            }
            Err(e) => {
                tracing::error!(service = %spec.service_name, error = %e, "Service creation rejected");
                return self.fail(e.into()).await;
            }
        }

        let mut backoff = ReadinessBackoff::new(self.poll_unit);
        let mut polls: u64 = 0;
        loop {
            let lookup = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abort_cancelled().await,
                result = self.lookup_task() => result,
            };
            self.record.last_polled_at = Some(Utc::now());
            polls += 1;

            match lookup {
                Ok(TaskLookup::Found(task)) => {
                    let status = task.describe();
                    self.record.last_status = Some(status.clone());
                    if task.state.is_running() {
                        self.transition(SessionState::Running)?;
                        tracing::info!(
                            service = %self.record.service_name,
                            polls,
                            "Session running"
                        );
                        return Ok(());
                    }
                    if !task.state.is_pending() {
                        return self
                            .fail(CourseHubError::LaunchFailed {
                                service: self.record.service_name.clone(),
                                status,
                            })
                            .await;
                    }
                }
                Ok(TaskLookup::NoTask) => {
                    self.record.last_status = Some("no task scheduled".to_string());
                }
                Ok(TaskLookup::Duplicate(count)) => {
                    return self
                        .fail(CourseHubError::consistency(format!(
                            "{} tasks want to run for service '{}'",
                            count, self.record.service_name
                        )))
                        .await;
                }
                Err(OrchestratorError::NotFound(_)) => {
                    let status = self
                        .record
                        .last_status
                        .clone()
                        .map(|s| format!("service not found (last status: {})", s))
                        .unwrap_or_else(|| "service not found".to_string());
                    return self
                        .fail(CourseHubError::LaunchFailed {
                            service: self.record.service_name.clone(),
                            status,
                        })
                        .await;
                }
                Err(e) => return self.fail(e.into()).await,
            }

            if polls > 1 {
                self.transition(SessionState::AwaitingReadiness)?;
            }
            self.record.retry_delay = backoff.current_units();
            self.publish();
            tracing::debug!(
                service = %self.record.service_name,
                status = ?self.record.last_status,
                retry_delay = backoff.current_units(),
                "Waiting for readiness"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abort_cancelled().await,
                _ = tokio::time::sleep(backoff.delay()) => {}
            }
            backoff.advance();
        }
    }

    /// Health check of a running session.
    ///
    /// Returns `None` when the task is healthy, otherwise a descriptive
    /// status. Never changes the lifecycle state.
    pub async fn poll(&mut self) -> Result<Option<String>> {
        if self.record.state != SessionState::Running {
            return Ok(Some(format!("session is {}", self.record.state)));
        }

        let lookup = self.lookup_task().await;
        self.record.last_polled_at = Some(Utc::now());
        let outcome = match lookup {
            Ok(TaskLookup::Found(task)) => {
                let status = task.describe();
                self.record.last_status = Some(status.clone());
                Ok(if task.state.is_quiet() { None } else { Some(status) })
            }
            Ok(TaskLookup::NoTask) => Ok(Some("no task scheduled".to_string())),
            Ok(TaskLookup::Duplicate(count)) => {
                tracing::error!(
                    service = %self.record.service_name,
                    count,
                    "Several tasks running for one session"
                );
                Err(CourseHubError::consistency(format!(
                    "{} tasks want to run for service '{}'",
                    count, self.record.service_name
                )))
            }
            Err(OrchestratorError::NotFound(_)) => Ok(Some("service not found".to_string())),
            Err(e) => Err(e.into()),
        };
        self.publish();
        outcome
    }

    /// Removes the service. Idempotent.
    ///
    /// A session that never started has nothing to remove. A launch still in
    /// progress is marked `Failed` first; a `Running` session goes through
    /// `Stopping` to `Removed`; a `Failed` session keeps its state and only has
    /// its service removed.
    pub async fn teardown(&mut self) -> Result<()> {
        match self.record.state {
            SessionState::Requested | SessionState::Removed => return Ok(()),
            SessionState::Creating | SessionState::AwaitingReadiness => {
                self.record.failure = Some("torn down before becoming ready".to_string());
                self.transition(SessionState::Failed)?;
            }
            SessionState::Running => self.transition(SessionState::Stopping)?,
            SessionState::Stopping | SessionState::Failed => {}
        }

        self.remove_service().await?;

        if self.record.state == SessionState::Stopping {
            self.transition(SessionState::Removed)?;
            tracing::info!(service = %self.record.service_name, "Session removed");
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        let from = self.record.state;
        self.record.transition(next)?;
        self.publish();
        if from != next {
            tracing::info!(
                session_id = %self.record.session_id,
                service = %self.record.service_name,
                from = %from,
                to = %next,
                "Session state changed"
            );
        }
        Ok(())
    }

    fn publish(&self) {
        self.updates.send_replace(self.record.clone());
    }

    async fn abort_cancelled(&mut self) -> Result<()> {
        self.fail(CourseHubError::Cancelled(
            "launch cancelled before the session became ready".to_string(),
        ))
        .await
    }

    /// Moves to `Failed`, removes the service and returns `error`.
    async fn fail(&mut self, error: CourseHubError) -> Result<()> {
        tracing::error!(
            session_id = %self.record.session_id,
            service = %self.record.service_name,
            last_status = ?self.record.last_status,
            error = %error,
            "Session launch failed"
        );
        self.record.failure = Some(error.to_string());
        self.transition(SessionState::Failed)?;

        if let Err(cleanup) = self.remove_service().await {
            tracing::warn!(
                service = %self.record.service_name,
                error = %cleanup,
                "Automatic teardown after failure did not complete"
            );
        }
        Err(error)
    }

    async fn remove_service(&self) -> Result<()> {
        match self.client.remove_service(&self.record.service_name).await {
            Ok(()) => {
                tracing::debug!(service = %self.record.service_name, "Service removed");
                Ok(())
            }
            Err(OrchestratorError::NotFound(_)) => {
                tracing::debug!(service = %self.record.service_name, "Service already gone");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    service = %self.record.service_name,
                    error = %e,
                    "Service removal failed"
                );
                Err(e.into())
            }
        }
    }

    /// Finds the task backing the service.
    ///
    /// Tasks with desired state `running` win; when there are none, the most
    /// recently updated task of any desired state is used.
    async fn lookup_task(&self) -> std::result::Result<TaskLookup, OrchestratorError> {
        let service = &self.record.service_name;
        let mut running = self
            .client
            .list_tasks(&TaskFilter::desired_running(service.as_str()))
            .await?;
        match running.len() {
            0 => {}
            1 => return Ok(running.pop().map_or(TaskLookup::NoTask, TaskLookup::Found)),
            count => return Ok(TaskLookup::Duplicate(count)),
        }

        let all = self.client.list_tasks(&TaskFilter::all(service.as_str())).await?;
        Ok(all
            .into_iter()
            .max_by_key(|t| t.updated_at)
            .map_or(TaskLookup::NoTask, TaskLookup::Found))
    }
}
