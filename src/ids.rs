use chrono::{DateTime, Utc};
use ulid::Ulid;

/// Generate a globally unique, time-ordered identifier. ULID text form sorts
/// lexicographically in creation order, which the prefix-scanned indices rely
/// on.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// The smallest id that a record created at `at` could have. Used as a scan
/// lower bound when a task only wants recent records.
pub fn id_floor(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis().max(0) as u64;
    Ulid::from_parts(millis, 0).to_string()
}
