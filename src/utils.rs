use time::OffsetDateTime;

use crate::resources::Time;

/// Unique record names. Safe for concurrent use.
pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now() -> Time {
    Time(OffsetDateTime::now_utc())
}
