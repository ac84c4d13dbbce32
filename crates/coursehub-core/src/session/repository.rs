//! Session record repository trait.

use async_trait::async_trait;

use super::model::SessionRecord;
use crate::error::Result;

/// Archive of finished session records.
///
/// # Implementation Notes
///
/// - `save` overwrites any record with the same `session_id`
/// - Listing order is unspecified
#[async_trait]
pub trait SessionRecordRepository: Send + Sync {
    /// Stores a record.
    ///
    /// # Arguments
    ///
    /// * `record` - The record to archive
    async fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Finds a record by session id.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(SessionRecord))`: Record found
    /// - `Ok(None)`: No such record
    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Lists every archived record.
    async fn list_all(&self) -> Result<Vec<SessionRecord>>;
}
