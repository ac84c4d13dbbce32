//! Session lifecycle domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CourseHubError, Result};
use crate::workspace::WorkspaceSnapshot;

/// Lifecycle state of a session.
///
/// ```text
/// Requested -> Creating -> AwaitingReadiness -> Running -> Stopping -> Removed
///                  |              |  ^    |
///                  |              +--+    |
///                  +------> Failed <------+
/// ```
///
/// `Failed` and `Removed` only lead back to a fresh `Requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Requested,
    Creating,
    AwaitingReadiness,
    Running,
    Stopping,
    Removed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "Requested",
            Self::Creating => "Creating",
            Self::AwaitingReadiness => "AwaitingReadiness",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Removed => "Removed",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Removed)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Requested, Creating)
                | (Creating, AwaitingReadiness)
                | (Creating, Failed)
                | (AwaitingReadiness, AwaitingReadiness)
                | (AwaitingReadiness, Running)
                | (AwaitingReadiness, Failed)
                | (Running, Stopping)
                | (Stopping, Removed)
                | (Failed, Requested)
                | (Removed, Requested)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

/// Operator-visible record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub subject_username: String,
    pub course_id: String,
    pub service_name: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Current readiness backoff delay in time-units.
    pub retry_delay: f64,
    /// Last task status observed by a readiness poll or health check.
    pub last_status: Option<String>,
    /// Orchestrator id of the created service.
    pub service_id: Option<String>,
    /// Error detail that moved the session to `Failed`.
    pub failure: Option<String>,
    /// Workspace the session was launched with; the next launch of the same
    /// subject reconciles against it.
    #[serde(default)]
    pub workspace: Option<WorkspaceSnapshot>,
    #[serde(default)]
    pub history: Vec<StateChange>,
}

impl SessionRecord {
    pub fn new(
        subject_username: impl Into<String>,
        course_id: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject_username: subject_username.into(),
            course_id: course_id.into(),
            service_name: service_name.into(),
            state: SessionState::Requested,
            created_at: Utc::now(),
            last_polled_at: None,
            retry_delay: 0.0,
            last_status: None,
            service_id: None,
            failure: None,
            workspace: None,
            history: Vec::new(),
        }
    }

    /// Moves to `next`, recording the change.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the lifecycle does not allow the move.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CourseHubError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.history.push(StateChange {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }

    /// Starts over from a fresh `Requested` record for the same subject and
    /// course. Only valid from `Failed` or `Removed`.
    pub fn restart(&self, course_id: impl Into<String>, service_name: impl Into<String>) -> Result<Self> {
        if !self.state.can_transition_to(SessionState::Requested) {
            return Err(CourseHubError::InvalidTransition {
                from: self.state.to_string(),
                to: SessionState::Requested.to_string(),
            });
        }
        Ok(Self::new(&self.subject_username, course_id, service_name))
    }

    /// States visited so far, starting with the initial one.
    pub fn visited_states(&self) -> Vec<SessionState> {
        match self.history.first() {
            None => vec![self.state],
            Some(first) => std::iter::once(first.from)
                .chain(self.history.iter().map(|c| c.to))
                .collect(),
        }
    }
}

/// Derives the orchestrator service name for `username`.
///
/// Names are limited to lower-case alphanumerics and `-`. When the username
/// has to be rewritten, a short digest of the original is appended so that
/// distinct usernames never share a service.
pub fn service_name_for(prefix: &str, username: &str) -> String {
    let sanitized: String = username
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    if sanitized == username {
        format!("{}-{}", prefix, sanitized)
    } else {
        let digest = Sha256::digest(username.as_bytes());
        let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}-{}", prefix, sanitized.trim_matches('-'), suffix)
    }
}
