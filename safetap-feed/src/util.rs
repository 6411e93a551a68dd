use time::OffsetDateTime;
use uuid::Uuid;

/// Current wall clock time as epoch milliseconds
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Fresh id for an optimistic entry. UUIDv7 ids sort by creation time.
pub fn new_local_id() -> String {
    Uuid::now_v7().to_string()
}
