//! Moodle web-service roster gateway.

use async_trait::async_trait;
use coursehub_core::config::RosterSettings;
use coursehub_core::course::{RosterEntry, RosterGateway};
use coursehub_core::error::{CourseHubError, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const REST_PATH: &str = "/webservice/rest/server.php";
const LEARNER_ROLE: &str = "student";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct EnrolledUser {
    id: u64,
    username: String,
    #[serde(default)]
    firstname: String,
    #[serde(default)]
    lastname: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    roles: Vec<EnrolledRole>,
}

#[derive(Debug, Deserialize)]
struct EnrolledRole {
    shortname: String,
}

#[derive(Debug, Deserialize)]
struct CoursesByField {
    #[serde(default)]
    courses: Vec<CourseSummary>,
}

#[derive(Debug, Deserialize)]
struct CourseSummary {
    id: u64,
}

/// [`RosterGateway`] calling the Moodle REST web service.
#[derive(Clone)]
pub struct MoodleRosterGateway {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for MoodleRosterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoodleRosterGateway")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl MoodleRosterGateway {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CourseHubError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Builds a gateway from the `[roster]` section, or `None` when no LMS
    /// is configured.
    pub fn from_settings(settings: &RosterSettings) -> Result<Option<Self>> {
        match (&settings.base_url, &settings.token) {
            (Some(base_url), Some(token)) => Self::new(base_url.clone(), token.clone()).map(Some),
            (None, None) => Ok(None),
            _ => Err(CourseHubError::config(
                "roster.base_url and roster.token must be set together",
            )),
        }
    }

    async fn call(&self, function: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, REST_PATH);
        let mut query: Vec<(&str, &str)> = vec![
            ("wstoken", self.token.as_str()),
            ("wsfunction", function),
            ("moodlewsrestformat", "json"),
        ];
        query.extend_from_slice(params);

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| CourseHubError::io(format!("roster request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CourseHubError::io(format!(
                "roster service returned HTTP {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CourseHubError::io(format!("invalid roster response: {}", e)))?;
        check_exception(&body)?;
        Ok(body)
    }

    async fn resolve_course(&self, course_id: &str) -> Result<String> {
        if course_id.chars().all(|c| c.is_ascii_digit()) {
            return Ok(course_id.to_string());
        }
        let body = self
            .call(
                "core_course_get_courses_by_field",
                &[("field", "shortname"), ("value", course_id)],
            )
            .await?;
        parse_course_lookup(body)?
            .map(|id| id.to_string())
            .ok_or_else(|| CourseHubError::not_found("course", course_id))
    }
}

#[async_trait]
impl RosterGateway for MoodleRosterGateway {
    async fn fetch_active_learners(&self, course_id: &str) -> Result<Vec<RosterEntry>> {
        let lms_course = self.resolve_course(course_id).await?;
        let body = self
            .call(
                "core_enrol_get_enrolled_users",
                &[("courseid", lms_course.as_str())],
            )
            .await?;
        let learners = parse_learners(body)?;
        tracing::debug!(course_id = %course_id, learners = learners.len(), "Roster fetched");
        Ok(learners)
    }
}

/// Web-service faults arrive as HTTP 200 with an `exception` object.
fn check_exception(body: &Value) -> Result<()> {
    if let Some(exception) = body.get("exception").and_then(Value::as_str) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(exception);
        return Err(CourseHubError::io(format!("roster service error: {}", message)));
    }
    Ok(())
}

fn parse_learners(body: Value) -> Result<Vec<RosterEntry>> {
    let users: Vec<EnrolledUser> = serde_json::from_value(body)?;
    Ok(users
        .into_iter()
        .filter(|user| user.roles.iter().any(|role| role.shortname == LEARNER_ROLE))
        .map(|user| RosterEntry {
            id: user.username,
            first_name: user.firstname,
            last_name: user.lastname,
            email: user.email,
            lms_user_id: Some(user.id),
        })
        .collect())
}

fn parse_course_lookup(body: Value) -> Result<Option<u64>> {
    let lookup: CoursesByField = serde_json::from_value(body)?;
    Ok(lookup.courses.first().map(|course| course.id))
}
