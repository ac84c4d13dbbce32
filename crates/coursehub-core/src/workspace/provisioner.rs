//! Workspace reconciliation.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use super::fs::{EntryKind, WorkspaceFs};
use super::mount::{MountPlan, WorkspaceSnapshot};
use super::planner::{CoursePaths, MountPlanner};
use super::policy::{
    DirectoryRule, Enforcement, GroupRef, HOME_MODE, OwnerRef, ROSTER_MODE, directory_rules,
};
use crate::config::AccountSettings;
use crate::course::CourseContext;
use crate::error::{CourseHubError, Result};
use crate::identity::{Role, Subject};

pub const ROSTER_FILE_NAME: &str = "roster.json";

/// Outcome of [`WorkspaceProvisioner::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub plan: MountPlan,
    /// Whether the workspace was (re)provisioned on this call.
    pub changed: bool,
}

impl Reconciliation {
    /// Snapshot to attach to the launched session.
    pub fn snapshot(&self, subject: &Subject, course: &CourseContext) -> WorkspaceSnapshot {
        WorkspaceSnapshot::new(&course.course_id, &subject.username, self.plan.clone())
    }
}

/// Numeric owners resolved for one provisioning pass.
#[derive(Debug, Clone, Copy)]
struct Owners {
    subject_uid: u32,
    subject_gid: u32,
    superuser_uid: u32,
    instructors: u32,
    learners: u32,
}

impl Owners {
    fn uid(&self, owner: OwnerRef) -> u32 {
        match owner {
            OwnerRef::Superuser => self.superuser_uid,
            OwnerRef::Subject => self.subject_uid,
        }
    }

    fn gid(&self, group: GroupRef) -> u32 {
        match group {
            GroupRef::Instructors => self.instructors,
            GroupRef::Learners => self.learners,
            GroupRef::Subject => self.subject_gid,
        }
    }
}

/// Brings the on-disk workspace of a (subject, course) pair in line with the
/// directory policy and produces the mount plan for the session.
///
/// Callers must serialize `reconcile` per (subject, course): the changed path
/// deletes and recreates the per-course working tree.
pub struct WorkspaceProvisioner {
    fs: Arc<dyn WorkspaceFs>,
    planner: MountPlanner,
    accounts: AccountSettings,
}

impl WorkspaceProvisioner {
    pub fn new(fs: Arc<dyn WorkspaceFs>, planner: MountPlanner, accounts: AccountSettings) -> Self {
        Self {
            fs,
            planner,
            accounts,
        }
    }

    pub fn planner(&self) -> &MountPlanner {
        &self.planner
    }

    /// Reconciles the workspace against `previous`.
    ///
    /// # Arguments
    ///
    /// * `subject` - Resolved subject identity
    /// * `course` - Course context; its roster is written for instructors
    /// * `previous` - Snapshot attached to the subject's previous session
    ///
    /// # Returns
    ///
    /// - `Ok(Reconciliation { changed: false, .. })`: The previous plan is
    ///   still valid. No filesystem write was made.
    /// - `Ok(Reconciliation { changed: true, .. })`: The working tree was
    ///   rebuilt and every host path of the returned plan exists.
    ///
    /// # Errors
    ///
    /// - `Config` when the directory-client configuration file is missing
    /// - `Consistency` when a policy path is occupied by a regular file
    /// - `Io` for any other filesystem failure
    pub fn reconcile(
        &self,
        subject: &Subject,
        course: &CourseContext,
        previous: Option<&WorkspaceSnapshot>,
    ) -> Result<Reconciliation> {
        let desired = self.planner.plan(subject, course)?;

        if let Some(previous) = previous
            && self.is_current(subject, course, previous, &desired)?
        {
            tracing::debug!(
                username = %subject.username,
                course = %course.course_id,
                "Workspace unchanged, reusing previous mount plan"
            );
            return Ok(Reconciliation {
                plan: previous.plan.clone(),
                changed: false,
            });
        }

        let paths = self.planner.paths(subject, &course.course_id);
        tracing::info!(
            username = %subject.username,
            course = %course.course_id,
            role = %subject.role,
            working = %paths.working.display(),
            "Provisioning workspace"
        );
        self.provision(subject, course, &paths)?;

        for host_path in desired.host_paths() {
            if !self.fs.exists(host_path)? {
                tracing::error!(
                    username = %subject.username,
                    course = %course.course_id,
                    path = %host_path.display(),
                    "Mount source missing after provisioning"
                );
                return Err(CourseHubError::consistency(format!(
                    "mount source '{}' does not exist after provisioning",
                    host_path.display()
                )));
            }
        }

        Ok(Reconciliation {
            plan: desired,
            changed: true,
        })
    }

    /// True when `previous` still describes a correct workspace. Read-only.
    fn is_current(
        &self,
        subject: &Subject,
        course: &CourseContext,
        previous: &WorkspaceSnapshot,
        desired: &MountPlan,
    ) -> Result<bool> {
        let course_id = course.course_id.as_str();
        let username = subject.username.as_str();

        if !previous.matches(course_id, username) || previous.plan.is_empty() {
            return Ok(false);
        }

        // Course sources bound into a home directory must land in this
        // subject's home for this course.
        let homes = subject
            .home_directory
            .parent()
            .unwrap_or(&subject.home_directory);

        for entry in &previous.plan {
            if has_component(&entry.host_path, course_id)
                && entry.container_path.starts_with(homes)
                && !(has_component(&entry.container_path, course_id)
                    && has_component(&entry.container_path, username))
            {
                tracing::debug!(
                    host = %entry.host_path.display(),
                    container = %entry.container_path.display(),
                    "Stale course binding in previous plan"
                );
                return Ok(false);
            }
            if !self.fs.exists(&entry.host_path)? {
                tracing::debug!(path = %entry.host_path.display(), "Mount source vanished");
                return Ok(false);
            }
        }

        Ok(previous.plan == *desired)
    }

    fn owners(&self, subject: &Subject) -> Owners {
        let accounts = &self.accounts;
        let (subject_uid, subject_gid) = match subject.owner_id() {
            Some(uid) => (
                uid,
                subject.group_id.unwrap_or(match subject.role {
                    Role::Instructor => accounts.instructor_gid,
                    Role::Learner => accounts.learner_gid,
                }),
            ),
            None => {
                tracing::warn!(
                    username = %subject.username,
                    fallback_uid = accounts.superuser_uid,
                    "Subject has no usable numeric id, provisioning as superuser"
                );
                (accounts.superuser_uid, accounts.superuser_gid)
            }
        };

        Owners {
            subject_uid,
            subject_gid,
            superuser_uid: accounts.superuser_uid,
            instructors: accounts.instructor_gid,
            learners: accounts.learner_gid,
        }
    }

    fn provision(&self, subject: &Subject, course: &CourseContext, paths: &CoursePaths) -> Result<()> {
        if !self.fs.exists(&paths.directory_client_config)? {
            return Err(CourseHubError::config(format!(
                "directory client configuration '{}' does not exist",
                paths.directory_client_config.display()
            )));
        }

        let owners = self.owners(subject);

        match self.fs.entry_kind(&paths.home)? {
            None => {
                self.fs.create_dir_all(&paths.home)?;
                self.fs
                    .set_owner(&paths.home, owners.subject_uid, owners.subject_gid)?;
                self.fs.set_mode(&paths.home, HOME_MODE)?;
                tracing::info!(home = %paths.home.display(), "Created home directory");
            }
            Some(EntryKind::Directory) => {}
            Some(kind) => {
                return Err(CourseHubError::consistency(format!(
                    "home '{}' is a {:?}, not a directory",
                    paths.home.display(),
                    kind
                )));
            }
        }

        if self.fs.entry_kind(&paths.class_root)? == Some(EntryKind::Symlink) {
            tracing::warn!(path = %paths.class_root.display(), "Removing symlinked class directory");
            self.fs.remove_file(&paths.class_root)?;
        }

        match self.fs.entry_kind(&paths.working)? {
            Some(EntryKind::Directory) => self.fs.remove_dir_all(&paths.working)?,
            Some(EntryKind::File | EntryKind::Symlink) => self.fs.remove_file(&paths.working)?,
            None => {}
        }

        for rule in directory_rules(paths, subject.role) {
            self.apply_rule(&rule, &owners)?;
        }

        self.replace_link(&paths.exchange_mount, &paths.working_exchange_link)?;

        if subject.role == Role::Instructor {
            let roster_path = paths.working.join(ROSTER_FILE_NAME);
            let contents = serde_json::to_vec_pretty(&course.roster)?;
            self.fs.write_file(&roster_path, &contents)?;
            self.fs
                .set_owner(&roster_path, owners.subject_uid, owners.instructors)?;
            self.fs.set_mode(&roster_path, ROSTER_MODE)?;
            tracing::debug!(
                path = %roster_path.display(),
                learners = course.roster.len(),
                "Wrote course roster"
            );
        }

        Ok(())
    }

    fn apply_rule(&self, rule: &DirectoryRule, owners: &Owners) -> Result<()> {
        let created = match self.fs.entry_kind(&rule.path)? {
            None => {
                self.fs.create_dir_all(&rule.path)?;
                true
            }
            Some(EntryKind::Directory) => false,
            Some(EntryKind::Symlink) => {
                tracing::warn!(path = %rule.path.display(), "Replacing symlink with directory");
                self.fs.remove_file(&rule.path)?;
                self.fs.create_dir_all(&rule.path)?;
                true
            }
            Some(EntryKind::File) => {
                return Err(CourseHubError::consistency(format!(
                    "'{}' is a regular file where a directory is required",
                    rule.path.display()
                )));
            }
        };

        if created || rule.enforcement == Enforcement::Always {
            self.fs
                .set_owner(&rule.path, owners.uid(rule.owner), owners.gid(rule.group))?;
            self.fs.set_mode(&rule.path, rule.mode)?;
            tracing::debug!(
                path = %rule.path.display(),
                mode = format_args!("{:o}", rule.mode),
                created,
                "Applied directory policy"
            );
        }
        Ok(())
    }

    /// Points `link` at `target`, unlinking whatever occupies `link` first.
    fn replace_link(&self, target: &Path, link: &Path) -> Result<()> {
        match self.fs.entry_kind(link)? {
            None => {}
            Some(EntryKind::Symlink | EntryKind::File) => self.fs.remove_file(link)?,
            Some(EntryKind::Directory) => {
                return Err(CourseHubError::consistency(format!(
                    "'{}' is a directory where a symlink is required",
                    link.display()
                )));
            }
        }
        self.fs.symlink(target, link)
    }
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components().any(|c| c.as_os_str() == OsStr::new(name))
}
