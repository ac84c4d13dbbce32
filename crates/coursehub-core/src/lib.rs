pub mod config;
pub mod course;
pub mod error;
pub mod identity;
pub mod session;
pub mod workspace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export common error type
pub use error::{CourseHubError, Result};
