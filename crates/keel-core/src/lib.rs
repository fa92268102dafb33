pub mod event;
pub mod id;
pub mod namespace;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt as _, Snafu};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub use self::event::{
    ChangeBatch, Event, EventBody, FormatError, Payload, SyncOperation, SyncStatus,
};
pub use self::id::EventId;

/// UTC instant with millisecond precision.
///
/// Stored as Unix milliseconds so ordering is plain numeric comparison; the
/// wire representation is RFC 3339 in both directions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        Self((nanos / 1_000_000).max(0) as u64)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub fn to_rfc3339(self) -> String {
        OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128 * 1_000_000)
            .expect("Millisecond instants stay in the formattable range")
            .format(&Rfc3339)
            .expect("UTC instants format losslessly")
    }

    pub fn from_rfc3339(s: &str) -> Result<Self, TimestampParseError> {
        let instant = OffsetDateTime::parse(s, &Rfc3339).context(ParseSnafu)?;
        let nanos = instant.unix_timestamp_nanos();
        if nanos < 0 {
            return PreEpochSnafu.fail();
        }
        Ok(Self((nanos / 1_000_000) as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

#[derive(Debug, Snafu)]
pub enum TimestampParseError {
    #[snafu(display("Invalid RFC 3339 timestamp"))]
    Parse { source: time::error::Parse },
    #[snafu(display("Timestamp predates the Unix epoch"))]
    PreEpoch,
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_rfc3339(&raw).map_err(serde::de::Error::custom)
    }
}
