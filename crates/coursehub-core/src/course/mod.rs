//! Course context and roster access.

pub mod model;
pub mod roster;

pub use model::{CourseContext, RosterEntry, validate_course_id};
pub use roster::RosterGateway;
