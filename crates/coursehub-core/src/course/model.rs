use serde::{Deserialize, Serialize};

use crate::error::{CourseHubError, Result};
use crate::identity::Role;

/// One active learner as reported by the LMS roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// LMS username.
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lms_user_id: Option<u64>,
}

/// Per-request course context.
///
/// Rebuilt on every launch from upstream data; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseContext {
    /// Stable short name of the course (e.g. `cs101`).
    pub course_id: String,
    /// Role of the requesting subject in this course.
    pub role: Role,
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
}

impl CourseContext {
    pub fn new(course_id: impl Into<String>, role: Role) -> Result<Self> {
        let course_id = course_id.into();
        validate_course_id(&course_id)?;
        Ok(Self {
            course_id,
            role,
            roster: Vec::new(),
        })
    }

    pub fn with_roster(mut self, roster: Vec<RosterEntry>) -> Self {
        self.roster = roster;
        self
    }
}

/// Course ids become path components on the host, so they must be plain
/// names.
pub fn validate_course_id(course_id: &str) -> Result<()> {
    let valid = !course_id.is_empty()
        && course_id != "."
        && course_id != ".."
        && course_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CourseHubError::config(format!(
            "invalid course id '{}'",
            course_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_id_validation() {
        assert!(CourseContext::new("cs101", Role::Learner).is_ok());
        assert!(CourseContext::new("2024-ML_intro.a", Role::Instructor).is_ok());
        for bad in ["", "..", "cs/101", "cs 101", "../etc"] {
            assert!(CourseContext::new(bad, Role::Learner).is_err(), "{}", bad);
        }
    }
}
