//! UTC timestamp helpers.
//!
//! All timestamps are stored as `timestamp without time zone` holding UTC.

use time::{OffsetDateTime, PrimitiveDateTime};

/// Current UTC time without offset.
pub fn utc_now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

/// Seconds since the unix epoch, truncating sub-second precision.
pub fn to_unix(at: PrimitiveDateTime) -> i64 {
    at.assume_utc().unix_timestamp()
}

/// Inverse of [`to_unix`].
pub fn from_unix(timestamp: i64) -> Result<PrimitiveDateTime, time::error::ComponentRange> {
    let at = OffsetDateTime::from_unix_timestamp(timestamp)?;
    Ok(PrimitiveDateTime::new(at.date(), at.time()))
}
