//! Assembly of a [`LaunchSpec`] from configuration and the provisioned
//! workspace.

use std::collections::BTreeMap;

use super::model::service_name_for;
use super::orchestrator::{LaunchSpec, ResourceLimits};
use crate::config::{OrchestratorSettings, parse_memory};
use crate::course::CourseContext;
use crate::error::{CourseHubError, Result};
use crate::identity::{Role, Subject};
use crate::workspace::{SNAPSHOT_LABEL, WorkspaceSnapshot};

pub const USERNAME_LABEL: &str = "coursehub.username";
pub const COURSE_LABEL: &str = "coursehub.course";

const SYSTEM_PATH: &str = "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin:/opt/conda/bin";

/// Builds the launch spec for `subject` in `course` with the mounts of
/// `snapshot`, which is also attached as a service label.
pub fn build_launch_spec(
    settings: &OrchestratorSettings,
    subject: &Subject,
    course: &CourseContext,
    snapshot: &WorkspaceSnapshot,
) -> Result<LaunchSpec> {
    let mem_limit = match subject.role {
        Role::Instructor => settings.instructor_mem_limit.as_deref(),
        Role::Learner => settings.learner_mem_limit.as_deref(),
    };
    let resources = ResourceLimits {
        cpu_guarantee: settings.cpu_guarantee,
        cpu_limit: settings.cpu_limit,
        mem_guarantee: memory(settings.mem_guarantee.as_deref())?,
        mem_limit: memory(mem_limit)?,
    };

    let home = subject.home_directory.to_string_lossy().into_owned();
    let mut env = BTreeMap::new();
    env.insert("NB_USER".to_string(), subject.username.clone());
    env.insert("USER".to_string(), subject.username.clone());
    if let Some(uid) = subject.owner_id() {
        env.insert("NB_UID".to_string(), uid.to_string());
    }
    if let Some(gid) = subject.group_id {
        env.insert("NB_GID".to_string(), gid.to_string());
    }
    env.insert("HOME".to_string(), home.clone());
    env.insert("PWD".to_string(), home.clone());
    env.insert("COURSE_ID".to_string(), course.course_id.clone());
    env.insert("COURSE_ROLE".to_string(), subject.role.to_string());
    env.insert("MPLCONFIGDIR".to_string(), format!("{}/.cache/matplotlib", home));
    env.insert("TZ".to_string(), settings.timezone.clone());
    env.insert(
        "GRANT_SUDO".to_string(),
        if settings.grant_sudo { "yes" } else { "no" }.to_string(),
    );
    env.insert(
        "PATH".to_string(),
        format!("{home}/.local/bin:{home}/bin:{SYSTEM_PATH}"),
    );

    let mut labels = BTreeMap::new();
    labels.insert(SNAPSHOT_LABEL.to_string(), snapshot.encode()?);
    labels.insert(USERNAME_LABEL.to_string(), subject.username.clone());
    labels.insert(COURSE_LABEL.to_string(), course.course_id.clone());

    Ok(LaunchSpec {
        service_name: service_name_for(&settings.service_prefix, &subject.username),
        image: settings.image.clone(),
        resources,
        env,
        args: settings.args.clone(),
        networks: settings.networks.clone(),
        placement_constraints: settings.placement_constraints.clone(),
        mounts: snapshot.plan.clone(),
        labels,
        user: Some("root".to_string()),
    })
}

fn memory(raw: Option<&str>) -> Result<Option<u64>> {
    raw.map(|value| parse_memory(value).map_err(CourseHubError::config))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::MountPlan;
    use std::path::PathBuf;

    fn subject(role: Role) -> Subject {
        Subject {
            username: "alice".to_string(),
            numeric_id: Some(2001),
            group_id: Some(3000),
            role,
            home_directory: PathBuf::from("/jupyter/alice"),
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            cpu_limit: Some(2.0),
            mem_guarantee: Some("256M".to_string()),
            instructor_mem_limit: Some("4G".to_string()),
            learner_mem_limit: Some("1G".to_string()),
            ..OrchestratorSettings::default()
        }
    }

    #[test]
    fn test_environment_and_labels() {
        let subject = subject(Role::Learner);
        let course = CourseContext::new("cs101", Role::Learner).unwrap();
        let snapshot = WorkspaceSnapshot::new("cs101", "alice", MountPlan::default());

        let spec = build_launch_spec(&settings(), &subject, &course, &snapshot).unwrap();

        assert_eq!(spec.service_name, "coursehub-alice");
        assert_eq!(spec.env["NB_UID"], "2001");
        assert_eq!(spec.env["NB_GID"], "3000");
        assert_eq!(spec.env["COURSE_ID"], "cs101");
        assert_eq!(spec.env["COURSE_ROLE"], "Learner");
        assert_eq!(spec.env["MPLCONFIGDIR"], "/jupyter/alice/.cache/matplotlib");
        assert!(spec.env["PATH"].starts_with("/jupyter/alice/.local/bin:/jupyter/alice/bin:"));
        assert_eq!(
            WorkspaceSnapshot::decode(&spec.labels[SNAPSHOT_LABEL]),
            Some(snapshot)
        );
    }

    #[test]
    fn test_memory_limit_follows_role() {
        let course = CourseContext::new("cs101", Role::Instructor).unwrap();
        let snapshot = WorkspaceSnapshot::new("cs101", "alice", MountPlan::default());

        let instructor =
            build_launch_spec(&settings(), &subject(Role::Instructor), &course, &snapshot).unwrap();
        let learner =
            build_launch_spec(&settings(), &subject(Role::Learner), &course, &snapshot).unwrap();

        assert_eq!(instructor.resources.mem_limit, Some(4 << 30));
        assert_eq!(learner.resources.mem_limit, Some(1 << 30));
        assert_eq!(learner.resources.mem_guarantee, Some(256 << 20));
        assert_eq!(learner.resources.cpu_limit_nanos(), Some(2_000_000_000));
        assert_eq!(learner.resources.cpu_guarantee_nanos(), None);
    }

    #[test]
    fn test_unresolved_uid_is_not_exported() {
        let mut subject = subject(Role::Learner);
        subject.numeric_id = None;
        let course = CourseContext::new("cs101", Role::Learner).unwrap();
        let snapshot = WorkspaceSnapshot::new("cs101", "alice", MountPlan::default());

        let spec = build_launch_spec(&settings(), &subject, &course, &snapshot).unwrap();
        assert!(!spec.env.contains_key("NB_UID"));
    }
}
