//! Workspace provisioning: mount planning, directory policy and
//! reconciliation against the previous session's snapshot.

pub mod fs;
pub mod mount;
pub mod planner;
pub mod policy;
pub mod provisioner;

pub use fs::{EntryKind, WorkspaceFs};
pub use mount::{MountDriver, MountMode, MountPlan, MountSpec, SNAPSHOT_LABEL, WorkspaceSnapshot};
pub use planner::{CoursePaths, MountPlanner};
pub use provisioner::{Reconciliation, WorkspaceProvisioner};
