//! Object and transaction identifiers, and timestamp-to-snapshot-key normalization.

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};

/// An 8-byte object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub [u8; 8]);

/// The object identifier of the database root.
pub const ZERO_OID: Oid = Oid([0; 8]);

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid(0x{})", hex(&self.0))
    }
}

impl From<u64> for Oid {
    fn from(v: u64) -> Self {
        Oid(v.to_be_bytes())
    }
}

/// An 8-byte, lexicographically ordered transaction identifier / snapshot key.
///
/// Ordering and equality are byte-wise, matching the canonical on-disk
/// representation: a `Tid` compares correctly with `<`/`>` without needing to
/// be decoded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub [u8; 8]);

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid(0x{})", hex(&self.0))
    }
}

impl Tid {
    /// Wrap a raw 8-byte transaction id as a `Tid` with no further conversion.
    pub fn from_raw(bytes: [u8; 8]) -> Self {
        Tid(bytes)
    }

    /// The smallest `Tid` strictly greater than `self`.
    ///
    /// Used to convert an inclusive "at or before `at`" read into an
    /// exclusive "strictly before" snapshot key: callers ask to read
    /// strictly before `self.later_than()`, which is the same as reading at
    /// or before `self`.
    pub fn later_than(self) -> Self {
        let v = u64::from_be_bytes(self.0);
        Tid((v.wrapping_add(1)).to_be_bytes())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A canonical timestamp, encoded as microseconds since the Unix epoch in an
/// 8-byte big-endian integer.
///
/// The source project packs a timestamp into 8 bytes using a bespoke
/// resolution-scaled encoding of `(year, month, day, hour, minute, second)`.
/// This core instead uses a flat microsecond counter: it is simpler, and
/// preserves every invariant the rest of the system depends on (byte-wise
/// ordering equals chronological ordering, and `later_than` produces the
/// smallest strictly-greater value).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct TimeStamp(u64);

impl TimeStamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let secs = dt.timestamp() as i64;
        let micros = dt.nanosecond() as i64 / 1_000;
        let total_micros = secs * 1_000_000 + micros;
        TimeStamp(total_micros.max(0) as u64)
    }

    pub fn from_tid(tid: Tid) -> Self {
        TimeStamp(u64::from_be_bytes(tid.0))
    }

    pub fn to_tid(self) -> Tid {
        Tid(self.0.to_be_bytes())
    }

    pub fn later_than(self) -> Self {
        TimeStamp(self.0.wrapping_add(1))
    }
}

/// Either side of the `at`/`before` selection accepted by `Database::open`.
#[derive(Clone, Copy, Debug)]
pub enum At {
    /// A wall-clock point in time, treated as UTC.
    DateTime(DateTime<Utc>),
    /// A raw transaction id.
    Tid(Tid),
}

impl From<DateTime<Utc>> for At {
    fn from(dt: DateTime<Utc>) -> Self {
        At::DateTime(dt)
    }
}

impl From<Tid> for At {
    fn from(tid: Tid) -> Self {
        At::Tid(tid)
    }
}

fn to_timestamp(at: At) -> TimeStamp {
    match at {
        At::DateTime(dt) => TimeStamp::from_datetime(dt),
        At::Tid(tid) => TimeStamp::from_tid(tid),
    }
}

/// Normalize an `at`/`before` selector pair to a single canonical `before`
/// snapshot key, per §4.5. Returns `Ok(None)` for "live" (both absent).
///
/// Exactly one of `at`/`before` may be `Some`; passing both is an argument
/// error the caller (the `Database`) reports as such.
pub fn normalize(at: Option<At>, before: Option<At>) -> Result<Option<Tid>, ()> {
    match (at, before) {
        (Some(_), Some(_)) => Err(()),
        (Some(at), None) => {
            let ts = to_timestamp(at).later_than();
            Ok(Some(ts.to_tid()))
        }
        (None, Some(before)) => Ok(Some(to_timestamp(before).to_tid())),
        (None, None) => Ok(None),
    }
}

/// Reconstruct a UTC `DateTime` from a `TimeStamp`, used only by tests and
/// diagnostics; the coordinator never needs to decode a snapshot key.
#[cfg(test)]
pub fn timestamp_to_datetime(ts: TimeStamp) -> DateTime<Utc> {
    use chrono::TimeZone;
    let micros = ts.0 as i64;
    Utc.timestamp(micros / 1_000_000, ((micros % 1_000_000) * 1_000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn later_than_is_strictly_greater() {
        let ts = TimeStamp::from_datetime(Utc.ymd(2020, 1, 1).and_hms(0, 0, 0));
        assert!(ts.later_than() > ts);
    }

    #[test]
    fn normalize_rejects_both() {
        let at = Some(At::Tid(Tid::from_raw([0; 8])));
        let before = Some(At::Tid(Tid::from_raw([1; 8])));
        assert!(normalize(at, before).is_err());
    }

    #[test]
    fn normalize_live_is_none() {
        assert_eq!(normalize(None, None).unwrap(), None);
    }

    #[test]
    fn normalize_at_is_strictly_later_than_at() {
        let dt = Utc.ymd(2020, 6, 15).and_hms(12, 0, 0);
        let at_tid = TimeStamp::from_datetime(dt).to_tid();
        let before = normalize(Some(At::DateTime(dt)), None).unwrap().unwrap();
        assert!(before > at_tid);
    }

    #[test]
    fn tid_ordering_is_bytewise() {
        let a = Tid([0, 0, 0, 0, 0, 0, 0, 1]);
        let b = Tid([0, 0, 0, 0, 0, 0, 0, 2]);
        assert!(a < b);
    }
}
