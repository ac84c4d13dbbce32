//! Directory service trait.
//!
//! Defines the narrow contract the identity reconciler needs from an
//! LDAP-like identity store.

use super::model::{AttributeChange, DirectoryEntry};
use crate::error::Result;
use std::collections::BTreeMap;

/// An external directory service holding one record per username.
///
/// Calls are short-lived and blocking; async callers run them on a bounded
/// worker pool.
///
/// # Implementation Notes
///
/// - `search` returns `Ok(None)` when no record exists. Absence is a normal
///   outcome, not an error.
/// - `modify` on a missing record must return a `NotFound` error.
/// - `add` on an existing record must return an error.
pub trait DirectoryService: Send + Sync {
    /// Looks up the record for `username`, returning only `attributes`
    /// (all attributes when the slice is empty).
    fn search(&self, username: &str, attributes: &[&str]) -> Result<Option<DirectoryEntry>>;

    /// Creates a record.
    fn add(
        &self,
        dn: &str,
        object_classes: &[&str],
        attributes: BTreeMap<String, Vec<String>>,
    ) -> Result<()>;

    /// Applies attribute changes to an existing record.
    fn modify(&self, dn: &str, changes: &[AttributeChange]) -> Result<()>;
}
