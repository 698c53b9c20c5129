//! Time partitioning used by storage backends.
//!
//! Messages are grouped in fixed one-hour buckets keyed by the start of the
//! hour, which scopes range scans and cleanup.

use shared_types::Timestamp;

/// Bucket width in milliseconds.
pub const BUCKET_SIZE_MILLIS: u64 = 3_600_000;

/// Start of the bucket containing `timestamp`.
#[must_use]
pub fn bucket_id(timestamp: Timestamp) -> u64 {
    let millis = timestamp.as_millis();
    millis - millis % BUCKET_SIZE_MILLIS
}
