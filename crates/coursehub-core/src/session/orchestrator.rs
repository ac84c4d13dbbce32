//! Cluster orchestrator contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::error::CourseHubError;
use crate::workspace::MountPlan;

/// CPU and memory settings of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Fractional CPUs reserved for the session.
    pub cpu_guarantee: Option<f64>,
    pub cpu_limit: Option<f64>,
    /// Bytes.
    pub mem_guarantee: Option<u64>,
    /// Bytes.
    pub mem_limit: Option<u64>,
}

impl ResourceLimits {
    pub fn cpu_guarantee_nanos(&self) -> Option<i64> {
        nano_cpus(self.cpu_guarantee)
    }

    pub fn cpu_limit_nanos(&self) -> Option<i64> {
        nano_cpus(self.cpu_limit)
    }
}

/// Converts fractional CPUs to nanocpus, truncating. Unset and zero values
/// yield `None` so the field is omitted rather than sent as zero.
pub fn nano_cpus(cpus: Option<f64>) -> Option<i64> {
    cpus.filter(|c| c.is_finite() && *c > 0.0)
        .map(|c| (c * 1e9) as i64)
        .filter(|n| *n > 0)
}

/// Everything the orchestrator needs to create a session service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub service_name: String,
    pub image: String,
    pub resources: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub networks: Vec<String>,
    pub placement_constraints: Vec<String>,
    pub mounts: MountPlan,
    pub labels: BTreeMap<String, String>,
    /// `uid[:gid]` the container process runs as, if not the image default.
    pub user: Option<String>,
}

/// Task status as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Allocated,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
    Unknown(String),
}

impl TaskState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "allocated" => Self::Allocated,
            "pending" => Self::Pending,
            "assigned" => Self::Assigned,
            "accepted" => Self::Accepted,
            "preparing" => Self::Preparing,
            "ready" => Self::Ready,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "shutdown" => Self::Shutdown,
            "failed" => Self::Failed,
            "rejected" => Self::Rejected,
            "remove" => Self::Remove,
            "orphaned" => Self::Orphaned,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Allocated => "allocated",
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Remove => "remove",
            Self::Orphaned => "orphaned",
            Self::Unknown(raw) => raw,
        }
    }

    /// Non-terminal states that keep a launch waiting for readiness.
    ///
    /// `rejected` is included: the orchestrator reschedules rejected tasks.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::New
                | Self::Allocated
                | Self::Assigned
                | Self::Accepted
                | Self::Starting
                | Self::Pending
                | Self::Preparing
                | Self::Ready
                | Self::Rejected
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// States a health check reports as healthy without detail.
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Starting | Self::Pending | Self::Preparing
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task (replica attempt) of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub state: TaskState,
    pub message: Option<String>,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    pub fn new(id: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            state,
            message: None,
            error: None,
            updated_at: None,
        }
    }

    /// Status string for operators: the state plus any orchestrator detail.
    pub fn describe(&self) -> String {
        let mut status = self.state.to_string();
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            status.push_str(": ");
            status.push_str(message);
        }
        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            status.push_str(" (");
            status.push_str(error);
            status.push(')');
        }
        status
    }
}

/// Task listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    pub service: String,
    /// Restrict to tasks whose desired state is `running`.
    pub desired_running: bool,
}

impl TaskFilter {
    pub fn desired_running(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            desired_running: true,
        }
    }

    pub fn all(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            desired_running: false,
        }
    }
}

/// Errors reported by orchestrator adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("API error ({status_code}): {message}")]
    Api { status_code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<OrchestratorError> for CourseHubError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(message) => CourseHubError::Orchestrator {
                status_code: Some(404),
                message,
            },
            OrchestratorError::Api {
                status_code,
                message,
            } => CourseHubError::Orchestrator {
                status_code: Some(status_code),
                message,
            },
            OrchestratorError::Transport(message) => CourseHubError::Orchestrator {
                status_code: None,
                message,
            },
        }
    }
}

/// Narrow orchestrator contract used by the lifecycle controller.
#[async_trait]
pub trait ClusterOrchestratorClient: Send + Sync {
    /// Creates a service and returns its orchestrator id.
    async fn create_service(&self, spec: &LaunchSpec) -> Result<String, OrchestratorError>;

    /// Lists tasks of a service.
    ///
    /// # Returns
    ///
    /// - `Ok(vec![])`: The service exists but has no matching task
    /// - `Err(OrchestratorError::NotFound)`: The service does not exist
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>, OrchestratorError>;

    /// Removes a service (by name or id) and its ephemeral volumes.
    async fn remove_service(&self, service: &str) -> Result<(), OrchestratorError>;
}
