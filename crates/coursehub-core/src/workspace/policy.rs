//! Directory ownership and permission policy.

use std::path::{Path, PathBuf};

use super::planner::CoursePaths;
use crate::identity::Role;

/// Who owns a provisioned directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerRef {
    Superuser,
    /// The subject, falling back to the superuser when unresolved.
    Subject,
}

/// Group of a provisioned directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRef {
    Instructors,
    Learners,
    /// The group of the subject's current role.
    Subject,
}

/// When a rule is enforced on an existing directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Ownership and mode are reapplied on every provisioning pass.
    Always,
    /// Only applied when the directory is created.
    OnCreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRule {
    pub path: PathBuf,
    pub owner: OwnerRef,
    pub group: GroupRef,
    pub mode: u32,
    pub enforcement: Enforcement,
}

impl DirectoryRule {
    fn new(
        path: &Path,
        owner: OwnerRef,
        group: GroupRef,
        mode: u32,
        enforcement: Enforcement,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            owner,
            group,
            mode,
            enforcement,
        }
    }
}

pub const HOME_MODE: u32 = 0o750;
pub const ROSTER_MODE: u32 = 0o640;

/// Directory rules for `role`, in creation order (parents first).
///
/// Learner directories under the working tree are never writable by the
/// learner group, and the shared course tree is owned by the superuser.
pub fn directory_rules(paths: &CoursePaths, role: Role) -> Vec<DirectoryRule> {
    use Enforcement::{Always, OnCreate};
    use GroupRef::{Instructors, Learners};
    use OwnerRef::Superuser;

    let instructor = role == Role::Instructor;
    let shared = if instructor { Always } else { OnCreate };
    let exchange_owner = if instructor { OwnerRef::Subject } else { Superuser };

    let mut rules = vec![
        DirectoryRule::new(&paths.share_course, Superuser, Instructors, 0o775, shared),
        DirectoryRule::new(&paths.share_dir, Superuser, Instructors, 0o775, shared),
    ];
    if instructor {
        rules.push(DirectoryRule::new(
            &paths.submit_dir,
            Superuser,
            Instructors,
            0o733,
            Always,
        ));
    }
    rules.extend([
        DirectoryRule::new(&paths.class_root, OwnerRef::Subject, GroupRef::Subject, 0o755, OnCreate),
        DirectoryRule::new(&paths.working, OwnerRef::Subject, Instructors, 0o775, Always),
        DirectoryRule::new(&paths.working_submit, OwnerRef::Subject, Instructors, 0o750, Always),
        DirectoryRule::new(&paths.exchange_root, Superuser, Instructors, 0o755, OnCreate),
        DirectoryRule::new(&paths.exchange_course, exchange_owner, Instructors, 0o755, shared),
        DirectoryRule::new(&paths.exchange_inbound, exchange_owner, Learners, 0o2733, shared),
        DirectoryRule::new(&paths.exchange_outbound, exchange_owner, Learners, 0o755, shared),
        DirectoryRule::new(&paths.exchange_feedback, exchange_owner, Learners, 0o711, shared),
    ]);
    rules
}
