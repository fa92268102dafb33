use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use uuid::Uuid;
use uuid::timestamp::context::ContextV7;

use crate::Timestamp;


/// Process-wide v7 context.
///
/// Carries the sub-millisecond counter that keeps ids generated within the
/// same millisecond strictly increasing.
///
/// `ContextV7` uses unsynchronized cells internally, so it must be behind a
/// mutex (which the `uuid` crate implements `ClockSequence` for) to be
/// shared across threads as a static.
static UUID_CONTEXT: LazyLock<Mutex<ContextV7>> = LazyLock::new(|| Mutex::new(ContextV7::new()));

/// Time-ordered event identifier (UUID v7).
///
/// Byte order, string order and creation order all agree, so an `EventId`
/// doubles as the ordering key of the event log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub const ZERO: Self = Self(Uuid::nil());
    pub const MAX: Self = Self(Uuid::max());

    /// Mint a fresh id from the current instant.
    pub fn generate() -> Self {
        Self(Uuid::new_v7(uuid::Timestamp::now(&*UUID_CONTEXT)))
    }

    /// The millisecond instant embedded in the id.
    ///
    /// Non-v7 values ([`EventId::ZERO`], [`EventId::MAX`]) fall back to the
    /// epoch.
    pub fn timestamp(&self) -> Timestamp {
        match self.0.get_timestamp() {
            Some(ts) => {
                let (secs, nanos) = ts.to_unix();
                Timestamp::from_millis(secs * 1000 + u64::from(nanos) / 1_000_000)
            }
            None => Timestamp::ZERO,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0.as_hyphenated(), f)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Invalid event id"))]
pub struct EventIdParseError {
    source: uuid::Error,
}

impl FromStr for EventId {
    type Err = EventIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s).context(EventIdParseSnafu)?))
    }
}
