//! Subject identity: directory records, credentials and role-based groups.

pub mod credential;
pub mod directory;
pub mod model;
pub mod reconciler;

pub use credential::{generate_credential, hash_credential, satisfies_policy};
pub use directory::DirectoryService;
pub use model::{AttributeChange, DirectoryEntry, Role, Subject};
pub use reconciler::IdentityReconciler;
