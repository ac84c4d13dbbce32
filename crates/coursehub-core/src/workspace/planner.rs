//! Mount planning.
//!
//! Pure path arithmetic: nothing here touches the filesystem.

use std::path::PathBuf;

use super::mount::{MountDriver, MountMode, MountPlan, MountSpec};
use crate::config::WorkspaceSettings;
use crate::course::CourseContext;
use crate::error::Result;
use crate::identity::{Role, Subject};

/// Host paths involved in one (subject, course) workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoursePaths {
    /// `H`: the subject's home directory.
    pub home: PathBuf,
    /// `H/<class_dir>`
    pub class_root: PathBuf,
    /// `W = H/<class_dir>/<course>`: per-course working subtree.
    pub working: PathBuf,
    pub working_submit: PathBuf,
    /// Anchor of the exchange symlink inside `W`.
    pub working_exchange_link: PathBuf,
    /// `S = share_root/<class_dir>/<course>`
    pub share_course: PathBuf,
    pub share_dir: PathBuf,
    pub submit_dir: PathBuf,
    pub exchange_root: PathBuf,
    /// `E = exchange_root/<course>`
    pub exchange_course: PathBuf,
    pub exchange_inbound: PathBuf,
    pub exchange_outbound: PathBuf,
    pub exchange_feedback: PathBuf,
    /// Where `E` appears inside the session container.
    pub exchange_mount: PathBuf,
    pub directory_client_config: PathBuf,
}

/// Computes the desired [`MountPlan`] for a subject in a course.
#[derive(Debug, Clone)]
pub struct MountPlanner {
    settings: WorkspaceSettings,
}

impl MountPlanner {
    pub fn new(settings: WorkspaceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    pub fn paths(&self, subject: &Subject, course_id: &str) -> CoursePaths {
        let settings = &self.settings;
        let home = subject.home_directory.clone();
        let class_root = home.join(&settings.class_dir_name);
        let working = class_root.join(course_id);
        let share_course = settings
            .share_root
            .join(&settings.class_dir_name)
            .join(course_id);
        let exchange_course = settings.exchange_root.join(course_id);

        CoursePaths {
            working_submit: working.join("submit"),
            working_exchange_link: working.join("exchange"),
            share_dir: share_course.join("share"),
            submit_dir: share_course.join("submit"),
            exchange_inbound: exchange_course.join("inbound"),
            exchange_outbound: exchange_course.join("outbound"),
            exchange_feedback: exchange_course.join("feedback"),
            exchange_mount: settings.exchange_mount_root.join(course_id),
            exchange_root: settings.exchange_root.clone(),
            directory_client_config: settings.directory_client_config.clone(),
            home,
            class_root,
            working,
            share_course,
            exchange_course,
        }
    }

    /// Plans the mounts for `subject` in `course`.
    ///
    /// Deterministic: identical inputs give an identical, identically
    /// ordered plan. Learners never receive a writable share mount.
    pub fn plan(&self, subject: &Subject, course: &CourseContext) -> Result<MountPlan> {
        let paths = self.paths(subject, &course.course_id);
        let driver = self.driver();
        let bind = |host: &PathBuf, container: &PathBuf, mode| {
            MountSpec::new(host.clone(), container.clone(), mode).with_driver(driver.clone())
        };

        let share_mode = match subject.role {
            Role::Instructor => MountMode::Rw,
            Role::Learner => MountMode::Ro,
        };

        let mut entries = vec![
            bind(&paths.home, &paths.home, MountMode::Rw),
            bind(&paths.share_dir, &paths.working.join("share"), share_mode),
        ];
        if subject.role == Role::Instructor {
            entries.push(bind(
                &paths.submit_dir,
                &paths.working.join("submissions"),
                MountMode::Rw,
            ));
        }
        entries.push(bind(
            &paths.exchange_course,
            &paths.exchange_mount,
            MountMode::Rw,
        ));
        entries.push(bind(
            &paths.directory_client_config,
            &paths.directory_client_config,
            MountMode::Ro,
        ));

        MountPlan::new(entries)
    }

    fn driver(&self) -> Option<MountDriver> {
        self.settings.volume_driver.as_ref().map(|name| MountDriver {
            name: name.clone(),
            options: self.settings.volume_driver_options.clone(),
        })
    }
}
