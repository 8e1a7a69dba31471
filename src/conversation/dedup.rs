//! Deduplication store interface
//!
//! Two lookups with different guarantees:
//! - `check_for_record` is advisory. Phase 1 uses it to skip reports that
//!   are obviously on file; it never blocks anyone.
//! - `check_and_create_record` is the authoritative create-if-absent. Exactly
//!   one caller per key gets `true`, which makes it the only
//!   cross-conversation synchronization point.

use chrono::{DateTime, Utc};

use super::types::{ExtractedReport, ProtocolError, RecordKey};

#[async_trait::async_trait]
pub trait DeduplicationStore: Send + Sync {
    /// Creation time of the record for `key`, if any
    async fn check_for_record(&self, key: &RecordKey) -> Result<Option<DateTime<Utc>>, ProtocolError>;

    /// Insert a reservation for `key`. Returns `false` if a record already exists.
    async fn check_and_create_record(&self, key: &RecordKey) -> Result<bool, ProtocolError>;

    /// Fill in a reservation created by `check_and_create_record`
    async fn update_record(
        &self,
        key: &RecordKey,
        report: &ExtractedReport,
        archive_location: &str,
    ) -> Result<(), ProtocolError>;

    /// Drop the record for `key` (rollback of a reservation)
    async fn remove_record(&self, key: &RecordKey) -> Result<(), ProtocolError>;

    /// Delete reservations created before `cutoff` that were never completed.
    ///
    /// Returns the number of rows removed.
    async fn purge_stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<u64, ProtocolError>;
}
