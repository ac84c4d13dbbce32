//! Roster gateway trait.

use async_trait::async_trait;

use super::model::RosterEntry;
use crate::error::Result;

/// Source of course rosters (an LMS web service in production).
///
/// Failures propagate as-is; callers do not retry.
#[async_trait]
pub trait RosterGateway: Send + Sync {
    /// Fetches the learners currently enrolled in `course_id`.
    ///
    /// # Arguments
    ///
    /// * `course_id` - Course short name
    ///
    /// # Returns
    ///
    /// - `Ok(Vec<RosterEntry>)`: Active learners, possibly empty
    /// - `Err(CourseHubError)`: Transport or protocol failure
    async fn fetch_active_learners(&self, course_id: &str) -> Result<Vec<RosterEntry>>;
}
