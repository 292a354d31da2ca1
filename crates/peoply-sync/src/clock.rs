//! Monotonic-enough UTC time source and the `FUTURE`/`PAST`/`EQUAL` comparator
//! the reconciler uses to classify events.

use std::cmp::Ordering;

use snafu::{ResultExt, Snafu};
use time::format_description::well_known::Rfc3339;
use time::macros::datetime;
use time::OffsetDateTime;

/// `0001-01-01T00:00:00Z`, substituted for missing upstream timestamps.
pub const SENTINEL: Instant = Instant(datetime!(0001-01-01 0:00:00 UTC));

#[derive(Debug, Snafu)]
pub enum ClockError {
    #[snafu(display("timestamp could not be parsed: {source}"))]
    Parse { source: time::error::Parse },
    #[snafu(display("timestamp carries a non-UTC offset"))]
    NotUtc,
}

pub type ClockResult<T> = std::result::Result<T, ClockError>;

/// A UTC instant, always truncated to millisecond precision on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(OffsetDateTime);

impl Instant {
    pub fn from_offset_date_time(dt: OffsetDateTime) -> ClockResult<Self> {
        if !dt.offset().is_utc() {
            return NotUtcSnafu.fail();
        }
        let millis = dt.millisecond();
        let truncated = dt.replace_nanosecond(millis as u32 * 1_000_000).expect("valid nanosecond");
        Ok(Self(truncated))
    }

    /// ISO-8601 UTC string with millisecond precision and a trailing `Z`.
    pub fn format(self) -> String {
        let dt = self.0;
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.millisecond(),
        )
    }

    /// Parses the string form produced by [`Instant::format`] (and any valid
    /// RFC 3339 timestamp). Rejects naive timestamps (no offset) and
    /// timestamps carrying an explicit non-UTC offset.
    pub fn parse(s: &str) -> ClockResult<Self> {
        let dt = OffsetDateTime::parse(s, &Rfc3339).context(ParseSnafu)?;
        Self::from_offset_date_time(dt)
    }

    pub fn into_offset_date_time(self) -> OffsetDateTime {
        self.0
    }
}

/// Names the relation of `b` to `a`: `EQUAL` when `a == b`, `FUTURE` when
/// `a < b`, `PAST` when `a > b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Future,
    Past,
    Equal,
}

pub fn compare(a: Instant, b: Instant) -> Relation {
    match a.0.cmp(&b.0) {
        Ordering::Less => Relation::Future,
        Ordering::Greater => Relation::Past,
        Ordering::Equal => Relation::Equal,
    }
}

/// Abstracts `now()` so tests can control time without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::from_offset_date_time(OffsetDateTime::now_utc())
            .expect("OffsetDateTime::now_utc is always UTC")
    }
}

/// A settable clock for deterministic tests (expiration sweeps, stale-upstream
/// scenarios, restart idempotence).
///
/// Not `#[cfg(test)]`: integration tests in `tests/` link against this crate
/// as an external crate, so anything they need has to survive a normal
/// (non-test) build. Kept out of the crate's public surface via
/// [`crate::test_support`] instead.
#[doc(hidden)]
pub mod fake {
    use std::sync::Mutex;

    use super::*;

    pub struct FakeClock(Mutex<Instant>);

    impl FakeClock {
        pub fn new(at: Instant) -> Self {
            Self(Mutex::new(at))
        }

        pub fn set(&self, at: Instant) {
            *self.0.lock().expect("lock poisoned") = at;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.0.lock().expect("lock poisoned")
        }
    }
}
